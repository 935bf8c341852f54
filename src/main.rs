use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};

use gh_describe::cache::{GhCloner, GitCli, GitCloner, RemoteCloner, RepoCache};
use gh_describe::cancel::CancelToken;
use gh_describe::config::{CacheConfig, format_duration, parse_duration};
use gh_describe::gateway::CommandGateway;
use gh_describe::identity::GhResolver;
use gh_describe::types::RepoRequest;

/// Freshness window used by the command line unless overridden.
const CLI_DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Parser)]
#[command(
    name = "gh-describe",
    about = "Run git describe and friends against cached bare clones of GitHub repositories"
)]
struct Cli {
    /// Repository in [HOST/]OWNER/NAME format (defaults to the current repository)
    #[arg(short = 'R', long = "repo", global = true)]
    repo: Option<String>,

    /// Cache directory (defaults to the user cache directory)
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// How long a cached clone stays fresh, e.g. 300, 5m, 2h, 1d
    #[arg(long, global = true, value_parser = parse_duration)]
    cache_ttl: Option<Duration>,

    /// Always refresh the cached clone
    #[arg(long, global = true, conflicts_with = "cache_ttl")]
    no_cache: bool,

    /// Tool used to clone repositories
    #[arg(long, global = true, value_enum, default_value_t = CloneVia::Gh)]
    clone_via: CloneVia,

    /// Give up after this long
    #[arg(long, global = true, value_parser = parse_duration)]
    timeout: Option<Duration>,

    /// Log level, overridden by RUST_LOG
    #[arg(long, global = true, default_value = "info")]
    log_level: log::LevelFilter,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum CloneVia {
    /// `gh repo clone`, using gh's authentication
    Gh,
    /// `git clone` over HTTPS
    Git,
}

#[derive(Subcommand)]
enum Commands {
    /// Run git describe
    Describe {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Run git rev-parse
    RevParse {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Run git rev-list
    RevList {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Print the path of the cached clone
    Path,
}

fn main() {
    let cli = Cli::parse();

    env_logger::Builder::new()
        .filter_level(cli.log_level)
        .parse_default_env()
        .init();

    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        if let Err(e) = ctrlc::set_handler(move || cancel.cancel()) {
            log::warn!("failed to install Ctrl-C handler: {}", e);
        }
    }
    let cancel = match cli.timeout {
        Some(timeout) => cancel.child_with_timeout(timeout),
        None => cancel,
    };

    let ttl = if cli.no_cache {
        Duration::ZERO
    } else {
        cli.cache_ttl.unwrap_or(CLI_DEFAULT_TTL)
    };
    let mut config = CacheConfig::new().with_default_ttl(ttl);
    if let Some(dir) = cli.cache_dir {
        config = config.with_root(dir);
    }

    let cloner: Arc<dyn RemoteCloner> = match cli.clone_via {
        CloneVia::Gh => Arc::new(GhCloner::new()),
        CloneVia::Git => Arc::new(GitCloner::default()),
    };
    let cache = RepoCache::from_config(&config, cloner, Arc::new(GhResolver::from_env()))?;
    log::debug!(
        "cache root {} (ttl {})",
        cache.paths().root().display(),
        format_duration(cache.default_ttl())
    );

    let request = match cli.repo {
        Some(repo) => RepoRequest::identifier(repo),
        None => RepoRequest::current(),
    };

    let (subcommand, args) = match cli.command {
        Commands::Describe { args } => ("describe", args),
        Commands::RevParse { args } => ("rev-parse", args),
        Commands::RevList { args } => ("rev-list", args),
        Commands::Path => {
            let path = cache.ensure_fresh_with_cancel(&request, &cancel)?;
            println!("{}", path.display());
            return Ok(());
        }
    };

    let gateway = CommandGateway::new(Arc::new(cache), Arc::new(GitCli::new()));
    let output = gateway.run_with_cancel(&request, subcommand, &args, &cancel)?;
    if !output.is_empty() {
        println!("{}", output);
    }
    Ok(())
}
