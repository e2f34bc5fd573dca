use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use colored::Colorize;
use cxo_crypto::{PubKey, SecretKey};
use cxo_registry::{Kind, Registry, Schema};
use cxo_skyobject::{Container, ContainerConfig, FillState, Root};
use cxo_sync::{Node, NodeConfig};
use serde_json::json;
use tracing::info;

use crate::cli::*;

pub fn run_command(cli: Cli) -> anyhow::Result<()> {
    let format = cli.format;
    let dir = cli.data_dir.as_path();
    match cli.command {
        Command::Keygen => cmd_keygen(format),
        Command::Serve(args) => cmd_serve(dir, args),
        Command::Stat => cmd_stat(&open(dir)?, format),
        Command::Feeds => cmd_feeds(&open(dir)?, format),
        Command::Roots(args) => cmd_roots(&open(dir)?, &args.feed, format),
        Command::Tree(args) => cmd_tree(&open(dir)?, args, format),
        Command::Post(args) => cmd_post(&open(dir)?, args, format),
        Command::Prune(args) => cmd_prune(&open(dir)?, args, format),
        Command::Sweep => cmd_sweep(&open(dir)?, format),
        Command::Compact => {
            let c = open(dir)?;
            c.compact()?;
            println!("{} Journals compacted.", "✓".green());
            Ok(())
        }
    }
}

/// Schemas every `cxo` process registers, so that trees saved by `post`
/// render with field names anywhere.
fn registry() -> anyhow::Result<Arc<Registry>> {
    let reg = Registry::new();
    reg.register(Schema::builder("Post").field("body", Kind::Str).build())?;
    reg.register(
        Schema::builder("Board")
            .field("title", Kind::Str)
            .field("posts", Kind::Refs("Post".into()))
            .build(),
    )?;
    Ok(Arc::new(reg))
}

fn open(dir: &Path) -> anyhow::Result<Container> {
    let config = ContainerConfig {
        data_dir: Some(dir.to_path_buf()),
        ..ContainerConfig::default()
    };
    Container::new(registry()?, config).with_context(|| format!("opening {}", dir.display()))
}

fn parse_feed(hex: &str) -> anyhow::Result<PubKey> {
    PubKey::from_hex(hex).map_err(|e| anyhow!("invalid feed key {hex:?}: {e}"))
}

fn print_json(value: &serde_json::Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn root_json(root: &Root, state: Option<FillState>) -> serde_json::Value {
    json!({
        "feed": root.pub_key.to_hex(),
        "seq": root.seq,
        "time": root.timestamp().to_rfc3339(),
        "prev": root.prev.to_hex(),
        "hash": root.hash.to_hex(),
        "state": state.map(|s| s.to_string()),
    })
}

fn paint(state: FillState) -> colored::ColoredString {
    match state {
        FillState::Full => state.to_string().green(),
        FillState::Filling => state.to_string().yellow(),
        FillState::Unfilled => state.to_string().red(),
    }
}

fn cmd_keygen(format: OutputFormat) -> anyhow::Result<()> {
    let sk = SecretKey::generate();
    let pk = sk.pub_key();
    match format {
        OutputFormat::Json => print_json(&json!({
            "pub_key": pk.to_hex(),
            "secret_key": sk.to_hex(),
        })),
        OutputFormat::Text => {
            println!("Public key: {}", pk.to_hex().cyan());
            println!("Secret key: {}", sk.to_hex().yellow());
            Ok(())
        }
    }
}

fn cmd_serve(dir: &Path, args: ServeArgs) -> anyhow::Result<()> {
    let mut config = match &args.config {
        Some(path) => NodeConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => NodeConfig::default(),
    };
    if config.container.data_dir.is_none() {
        config.container.data_dir = Some(dir.to_path_buf());
    }
    if args.listen.is_some() {
        config.listen = args.listen;
    }
    config.peers.extend(args.peers);
    config.feeds.extend(args.feeds);
    config.validate()?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async move {
        let container = Container::new(registry()?, config.container.clone())?;
        let node = Node::new(container, config)?;
        if let Some(addr) = node.start().await? {
            println!("{} Listening on {}", "✓".green().bold(), addr.to_string().bold());
        }
        for feed in node.subscriptions() {
            println!("  Replicating {}", feed.to_hex().cyan());
        }
        tokio::signal::ctrl_c().await?;
        info!("interrupted, shutting down");
        node.close().await?;
        Ok::<_, anyhow::Error>(())
    })
}

fn cmd_stat(c: &Container, format: OutputFormat) -> anyhow::Result<()> {
    let stat = c.stat()?;
    match format {
        OutputFormat::Json => print_json(&serde_json::to_value(stat)?),
        OutputFormat::Text => {
            println!("Feeds:   {}", stat.feeds.to_string().bold());
            println!("Roots:   {} ({} full)", stat.roots, stat.full_roots);
            println!("Objects: {} ({} bytes)", stat.store.objects, stat.store.volume);
            println!("Refs:    {}", stat.store.refs);
            println!("Parked:  {}", stat.store.parked);
            println!("Pending: {}", stat.pending);
            Ok(())
        }
    }
}

fn cmd_feeds(c: &Container, format: OutputFormat) -> anyhow::Result<()> {
    let feeds = c.feeds();
    match format {
        OutputFormat::Json => {
            let list: Vec<_> = feeds
                .iter()
                .map(|pk| {
                    json!({
                        "feed": pk.to_hex(),
                        "last_seq": c.last_root(pk).map(|r| r.seq),
                        "last_full_seq": c.last_full_root(pk).map(|r| r.seq),
                    })
                })
                .collect();
            print_json(&json!(list))
        }
        OutputFormat::Text => {
            if feeds.is_empty() {
                println!("No feeds.");
            }
            for pk in &feeds {
                let last = c
                    .last_root(pk)
                    .map(|r| format!("seq {}", r.seq))
                    .unwrap_or_else(|| "no roots".into());
                println!("{}  {}", pk.to_hex().cyan(), last.dimmed());
            }
            Ok(())
        }
    }
}

fn cmd_roots(c: &Container, feed: &str, format: OutputFormat) -> anyhow::Result<()> {
    let pk = parse_feed(feed)?;
    let roots = c.roots(&pk)?;
    match format {
        OutputFormat::Json => {
            let list: Vec<_> = roots.iter().map(|(r, s)| root_json(r, Some(*s))).collect();
            print_json(&json!(list))
        }
        OutputFormat::Text => {
            if roots.is_empty() {
                println!("No roots.");
            }
            for (root, state) in &roots {
                println!(
                    "{:>6}  {}  {}  {}",
                    root.seq.to_string().yellow(),
                    root.hash.short_hex(),
                    paint(*state),
                    root.timestamp().format("%Y-%m-%d %H:%M:%S").to_string().dimmed(),
                );
            }
            Ok(())
        }
    }
}

fn cmd_tree(c: &Container, args: TreeArgs, format: OutputFormat) -> anyhow::Result<()> {
    let pk = parse_feed(&args.feed)?;
    let root = match args.seq {
        Some(seq) => c.root_by_seq(&pk, seq)?,
        None => c.last_root(&pk).ok_or_else(|| anyhow!("feed {} has no roots", pk.short_hex()))?,
    };
    let tree = c.inspect(&root)?;
    match format {
        OutputFormat::Json => {
            let mut value = root_json(&root, c.fill_state(&pk, root.seq));
            value["tree"] = json!(tree.lines().collect::<Vec<_>>());
            print_json(&value)
        }
        OutputFormat::Text => {
            print!("{tree}");
            Ok(())
        }
    }
}

fn cmd_post(c: &Container, args: PostArgs, format: OutputFormat) -> anyhow::Result<()> {
    let sk = SecretKey::from_hex(&args.secret).map_err(|e| anyhow!("invalid secret key: {e}"))?;
    let mut pack = c.create_pack(&sk)?;
    let mut board = c.registry().object("Board")?.with("title", args.title.as_str())?;
    for body in &args.posts {
        let post = c.registry().object("Post")?.with("body", body.as_str())?;
        board.refs_mut("posts")?.push(post, c)?;
    }
    pack.replace(Vec::new())?;
    pack.append(board)?;
    let root = pack.save()?;
    c.close()?;

    match format {
        OutputFormat::Json => print_json(&root_json(&root, Some(FillState::Full))),
        OutputFormat::Text => {
            println!("{} Saved {}", "✓".green().bold(), root.to_string().yellow());
            println!("  Posts: {}", args.posts.len());
            Ok(())
        }
    }
}

fn cmd_prune(c: &Container, args: PruneArgs, format: OutputFormat) -> anyhow::Result<()> {
    let pk = parse_feed(&args.feed)?;
    let report = c.prune_feed(&pk, args.keep)?;
    c.close()?;
    match format {
        OutputFormat::Json => print_json(&serde_json::to_value(&report)?),
        OutputFormat::Text => {
            println!(
                "{} Pruned {} roots, {} objects removed.",
                "✓".green(),
                report.roots.len(),
                report.objects
            );
            Ok(())
        }
    }
}

fn cmd_sweep(c: &Container, format: OutputFormat) -> anyhow::Result<()> {
    let removed = c.sweep_orphans()?;
    c.close()?;
    match format {
        OutputFormat::Json => print_json(&json!({ "removed": removed })),
        OutputFormat::Text => {
            println!("{} Sweep: {} objects removed.", "✓".green(), removed);
            Ok(())
        }
    }
}
