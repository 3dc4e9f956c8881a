/// Tree Preview — interactive shell for exploring a passive tree.
///
/// Usage: tree_preview [--tree <path>] [--config <path>] [--save-dir <dir>]
///                     [--character <id>] [--seed <n>]
///
/// Commands:
///   alloc <node>               — add a rank to a node
///   dealloc <node>             — remove a node and refund it
///   why <node>                 — explain why a node cannot be allocated
///   connect <point> <board>    — attach a board at an extension point
///   disconnect <board>         — detach a board
///   show [board]               — draw a board grid
///   boards                     — list boards and connections
///   stats                      — print current stat totals
///   random <n>                 — allocate up to n random reachable nodes
///   unlimited on|off           — toggle the unlimited-points debug mode
///   reset                      — clear all progress
///   save                       — write progress to the save directory
///   help                       — list commands
///   quit                       — exit

use passive_tree::core::config::EngineConfig;
use passive_tree::core::definition::TreeDefinition;
use passive_tree::core::engine::AllocationEngine;
use passive_tree::core::events::TreeEvent;
use passive_tree::core::persistence::RonFileStore;
use passive_tree::core::tree::Tree;
use passive_tree::schema::board::Board;
use passive_tree::schema::node::GridPos;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::io::{self, BufRead, Write};
use std::path::Path;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "passive_tree=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return;
    }

    let mut tree_path = None;
    let mut config_path = None;
    let mut save_dir = None;
    let mut character = "preview".to_string();
    let mut seed: u64 = 42;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--tree" if i + 1 < args.len() => {
                i += 1;
                tree_path = Some(args[i].clone());
            }
            "--config" if i + 1 < args.len() => {
                i += 1;
                config_path = Some(args[i].clone());
            }
            "--save-dir" if i + 1 < args.len() => {
                i += 1;
                save_dir = Some(args[i].clone());
            }
            "--character" if i + 1 < args.len() => {
                i += 1;
                character = args[i].clone();
            }
            "--seed" if i + 1 < args.len() => {
                i += 1;
                seed = args[i].parse().unwrap_or(42);
            }
            _ => {
                eprintln!("Unknown argument: {}", args[i]);
                print_usage();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    let mut engine = match build_engine(tree_path.as_deref(), config_path.as_deref(), save_dir.as_deref(), &character) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("ERROR: {}", e);
            std::process::exit(1);
        }
    };

    engine.subscribe(Box::new(|event: &TreeEvent| match event {
        TreeEvent::NodeAllocated(node) => {
            println!("  + {} (rank {}/{})", node.id, node.current_rank(), node.max_rank)
        }
        TreeEvent::NodeDeallocated(node) => println!("  - {}", node.id),
        TreeEvent::BoardConnected(conn) => {
            println!("  board '{}' attached at '{}'", conn.board_id, conn.extension_point_id)
        }
        TreeEvent::BoardDisconnected(conn) => println!("  board '{}' detached", conn.board_id),
        TreeEvent::StatsRecalculated => {}
    }));

    let mut rng = StdRng::seed_from_u64(seed);

    println!(
        "Loaded {} nodes on {} boards",
        engine.tree().node_count(),
        engine.tree().boards().len()
    );
    println!("Character: {}  Points: {}  Seed: {}", character, engine.available_points(), seed);
    println!("Type 'help' for commands.\n");

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("tree> ");
        stdout.flush().ok();

        let mut line = String::new();
        if stdin.lock().read_line(&mut line).is_err() || line.is_empty() {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        let cmd = parts[0].to_lowercase();

        match cmd.as_str() {
            "quit" | "exit" | "q" => {
                println!("Goodbye.");
                break;
            }
            "help" | "h" | "?" => print_help(),
            "alloc" | "a" => {
                let Some(id) = parts.get(1) else {
                    println!("Usage: alloc <node>");
                    continue;
                };
                match engine.allocate_node(id) {
                    Ok(_) => println!("Points left: {}", engine.available_points()),
                    Err(e) => {
                        println!("ERROR: {}", e);
                        print_blockers(&engine, id);
                    }
                }
            }
            "dealloc" | "d" => {
                let Some(id) = parts.get(1) else {
                    println!("Usage: dealloc <node>");
                    continue;
                };
                match engine.deallocate_node(id) {
                    Ok(()) => println!("Points left: {}", engine.available_points()),
                    Err(e) => println!("ERROR: {}", e),
                }
            }
            "why" => {
                let Some(id) = parts.get(1) else {
                    println!("Usage: why <node>");
                    continue;
                };
                print_blockers(&engine, id);
            }
            "connect" => {
                if parts.len() < 3 {
                    println!("Usage: connect <extension_point> <board>");
                    continue;
                }
                if let Err(e) = engine.connect_board(parts[1], parts[2]) {
                    println!("ERROR: {}", e);
                }
            }
            "disconnect" => {
                let Some(board) = parts.get(1) else {
                    println!("Usage: disconnect <board>");
                    continue;
                };
                if let Err(e) = engine.disconnect_board(board) {
                    println!("ERROR: {}", e);
                }
            }
            "show" => {
                let board_id = parts
                    .get(1)
                    .copied()
                    .unwrap_or_else(|| engine.tree().core_board().id.as_str());
                match engine.find_board_by_id(board_id) {
                    Some(board) => print_board(board),
                    None => println!("Unknown board: {}", board_id),
                }
            }
            "boards" => {
                for board in engine.tree().boards() {
                    let status = match engine
                        .connected_boards()
                        .iter()
                        .find(|c| c.board_id == board.id)
                    {
                        Some(conn) => format!("attached at '{}'", conn.extension_point_id),
                        None if engine.tree().is_board_active(board.id.as_str(), engine.connected_boards()) => {
                            "always active".to_string()
                        }
                        None => "detached".to_string(),
                    };
                    let points: Vec<&str> = board.extension_points.iter().map(|p| p.id.as_str()).collect();
                    println!(
                        "  {:<14} {:?} {} nodes, {}; points: {:?}",
                        board.id.as_str(),
                        board.kind,
                        board.node_count(),
                        status,
                        points
                    );
                }
                println!(
                    "  {}/{} boards attached",
                    engine.connected_boards().len(),
                    engine.tree().max_connected_boards()
                );
            }
            "stats" => match engine.current_stats() {
                Ok(stats) => {
                    if stats.is_empty() {
                        println!("No stats.");
                    }
                    let mut entries: Vec<(&String, &f64)> = stats.iter().collect();
                    entries.sort_by(|a, b| a.0.cmp(b.0));
                    for (stat, value) in entries {
                        println!("  {:<24} {:>8.1}", stat, value);
                    }
                }
                Err(e) => println!("ERROR: {}", e),
            },
            "random" => {
                let count: usize = match parts.get(1).map(|s| s.parse()) {
                    Some(Ok(n)) if n > 0 => n,
                    _ => {
                        println!("Usage: random <n>");
                        continue;
                    }
                };
                let mut allocated = 0;
                for _ in 0..count {
                    let candidates: Vec<String> = engine
                        .all_nodes()
                        .into_iter()
                        .filter(|n| engine.can_allocate_node(n.id.as_str()))
                        .map(|n| n.id.to_string())
                        .collect();
                    let Some(pick) = candidates.choose(&mut rng) else {
                        break;
                    };
                    if engine.allocate_node(pick).is_ok() {
                        allocated += 1;
                    }
                }
                println!("Allocated {} of {} requested", allocated, count);
            }
            "unlimited" => match parts.get(1).copied() {
                Some("on") => engine.set_unlimited_points(true),
                Some("off") => engine.set_unlimited_points(false),
                _ => println!(
                    "Usage: unlimited on|off (currently {})",
                    if engine.is_unlimited_points() { "on" } else { "off" }
                ),
            },
            "reset" => match engine.reset_progress() {
                Ok(()) => println!("Progress reset. Points: {}", engine.available_points()),
                Err(e) => println!("ERROR: {}", e),
            },
            "save" => match engine.save_progress() {
                Ok(()) => println!("Saved."),
                Err(e) => println!("ERROR: {}", e),
            },
            _ => println!("Unknown command: {}. Type 'help' for commands.", cmd),
        }
    }
}

fn print_usage() {
    println!("Tree Preview — interactive shell for exploring a passive tree.");
    println!();
    println!("Usage: tree_preview [--tree <path>] [--config <path>] [--save-dir <dir>] [--character <id>] [--seed <n>]");
    println!();
    println!("  --tree <path>       Tree definition RON file (default: built-in tree)");
    println!("  --config <path>     Engine config RON file (default: built-in defaults)");
    println!("  --save-dir <dir>    Directory for save files (default: no persistence)");
    println!("  --character <id>    Character to load and save (default: preview)");
    println!("  --seed <n>          RNG seed for 'random' (default: 42)");
}

fn print_help() {
    println!("Commands:");
    println!("  alloc <node>             Add a rank to a node");
    println!("  dealloc <node>           Remove a node and refund it");
    println!("  why <node>               Explain why a node cannot be allocated");
    println!("  connect <point> <board>  Attach a board at an extension point");
    println!("  disconnect <board>       Detach a board");
    println!("  show [board]             Draw a board (default: core)");
    println!("  boards                   List boards and connections");
    println!("  stats                    Print current stat totals");
    println!("  random <n>               Allocate up to n random reachable nodes");
    println!("  unlimited on|off         Toggle unlimited points");
    println!("  reset                    Clear all progress");
    println!("  save                     Write progress to the save directory");
    println!("  help                     Show this help");
    println!("  quit                     Exit");
    println!();
    println!("Grid legend: uppercase = allocated, lowercase = free, + = extension point, . = empty");
}

fn build_engine(
    tree_path: Option<&str>,
    config_path: Option<&str>,
    save_dir: Option<&str>,
    character: &str,
) -> Result<AllocationEngine, Box<dyn std::error::Error>> {
    let definition = match tree_path {
        Some(path) => TreeDefinition::load_from_ron(Path::new(path))?,
        None => TreeDefinition::builtin()?,
    };
    let config = match config_path {
        Some(path) => EngineConfig::load_from_ron(Path::new(path))?,
        None => EngineConfig::default(),
    };

    let mut builder = AllocationEngine::builder()
        .tree(Tree::from_definition(&definition)?)
        .config(config)
        .character(character)
        .board_builder(Box::new(definition));
    if let Some(dir) = save_dir {
        builder = builder.store(Box::new(RonFileStore::open(dir)?));
    }
    Ok(builder.build_ready()?)
}

fn print_blockers(engine: &AllocationEngine, id: &str) {
    match engine.allocation_blockers(id) {
        Ok(reasons) if reasons.is_empty() => println!("  '{}' can be allocated", id),
        Ok(reasons) => println!("  '{}' blocked: {:?}", id, reasons),
        Err(e) => println!("  {}", e),
    }
}

fn print_board(board: &Board) {
    println!("{} ({:?}, {})", board.id, board.kind, board.size);
    for y in 0..board.size.height as i32 {
        let row: String = (0..board.size.width as i32)
            .map(|x| {
                let pos = GridPos::new(x, y);
                match board.node_at(pos) {
                    Some(node) if node.is_allocated() => node.kind.glyph().to_ascii_uppercase(),
                    Some(node) => node.kind.glyph().to_ascii_lowercase(),
                    None if board.extension_points.iter().any(|p| p.position == pos) => '+',
                    None => '.',
                }
            })
            .flat_map(|c| [c, ' '])
            .collect();
        println!("  {}", row.trim_end());
    }
}
