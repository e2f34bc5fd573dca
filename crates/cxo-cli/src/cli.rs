use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "cxo",
    about = "CXO: content-addressed objects replicated over signed feeds",
    version,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Directory holding the object and Root journals
    #[arg(long, global = true, default_value = ".cxo")]
    pub data_dir: PathBuf,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Generate a feed key pair
    Keygen,
    /// Run a replicating node
    Serve(ServeArgs),
    /// Show store and feed statistics
    Stat,
    /// List tracked feeds
    Feeds,
    /// List the retained Roots of a feed
    Roots(FeedArgs),
    /// Print the object tree of a Root
    Tree(TreeArgs),
    /// Save a Root of sample posts to a feed
    Post(PostArgs),
    /// Drop old Roots of a feed
    Prune(PruneArgs),
    /// Delete unreferenced objects
    Sweep,
    /// Rewrite the journals as snapshots
    Compact,
}

#[derive(Args)]
pub struct ServeArgs {
    /// Node configuration (TOML)
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Listen address, overriding the configuration
    #[arg(long)]
    pub listen: Option<SocketAddr>,
    /// Peer to connect to, in addition to the configured ones
    #[arg(long = "peer")]
    pub peers: Vec<SocketAddr>,
    /// Feed to replicate, in addition to the configured ones
    #[arg(long = "feed")]
    pub feeds: Vec<String>,
}

#[derive(Args)]
pub struct FeedArgs {
    /// Hex public key of the feed
    pub feed: String,
}

#[derive(Args)]
pub struct TreeArgs {
    pub feed: String,
    /// Sequence number; the latest Root by default
    #[arg(long)]
    pub seq: Option<u64>,
}

#[derive(Args)]
pub struct PostArgs {
    /// Hex secret key of the feed
    #[arg(long)]
    pub secret: String,
    /// Board title
    #[arg(long, default_value = "board")]
    pub title: String,
    /// Post bodies, one per argument
    #[arg(required = true)]
    pub posts: Vec<String>,
}

#[derive(Args)]
pub struct PruneArgs {
    pub feed: String,
    /// Number of newest Roots to keep
    #[arg(long, default_value = "1")]
    pub keep: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_keygen() {
        let cli = Cli::try_parse_from(["cxo", "keygen"]).unwrap();
        assert!(matches!(cli.command, Command::Keygen));
        assert_eq!(cli.format, OutputFormat::Text);
        assert_eq!(cli.data_dir, PathBuf::from(".cxo"));
    }

    #[test]
    fn parse_serve() {
        let cli = Cli::try_parse_from([
            "cxo",
            "serve",
            "--config",
            "node.toml",
            "--listen",
            "0.0.0.0:8870",
            "--peer",
            "10.0.0.2:8870",
            "--peer",
            "10.0.0.3:8870",
        ])
        .unwrap();
        if let Command::Serve(args) = cli.command {
            assert_eq!(args.config, Some(PathBuf::from("node.toml")));
            assert_eq!(args.listen, Some("0.0.0.0:8870".parse().unwrap()));
            assert_eq!(args.peers.len(), 2);
            assert!(args.feeds.is_empty());
        } else {
            panic!("wrong command");
        }
    }

    #[test]
    fn parse_tree_with_seq() {
        let cli = Cli::try_parse_from(["cxo", "tree", "abcd", "--seq", "7"]).unwrap();
        if let Command::Tree(args) = cli.command {
            assert_eq!(args.feed, "abcd");
            assert_eq!(args.seq, Some(7));
        } else {
            panic!("wrong command");
        }
    }

    #[test]
    fn parse_prune() {
        let cli = Cli::try_parse_from(["cxo", "prune", "abcd", "--keep", "3"]).unwrap();
        if let Command::Prune(args) = cli.command {
            assert_eq!(args.keep, 3);
        } else {
            panic!("wrong command");
        }
        let cli = Cli::try_parse_from(["cxo", "prune", "abcd"]).unwrap();
        assert!(matches!(cli.command, Command::Prune(PruneArgs { keep: 1, .. })));
    }

    #[test]
    fn parse_post_needs_bodies() {
        assert!(Cli::try_parse_from(["cxo", "post", "--secret", "00"]).is_err());
        let cli = Cli::try_parse_from(["cxo", "post", "--secret", "00", "hi", "there"]).unwrap();
        if let Command::Post(args) = cli.command {
            assert_eq!(args.posts, vec!["hi", "there"]);
            assert_eq!(args.title, "board");
        } else {
            panic!("wrong command");
        }
    }

    #[test]
    fn parse_global_flags() {
        let cli = Cli::try_parse_from([
            "cxo", "stat", "--verbose", "--format", "json", "--data-dir", "/tmp/x",
        ])
        .unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.format, OutputFormat::Json);
        assert_eq!(cli.data_dir, PathBuf::from("/tmp/x"));
    }

    #[test]
    fn parse_invalid_command() {
        assert!(Cli::try_parse_from(["cxo", "frobnicate"]).is_err());
    }
}
