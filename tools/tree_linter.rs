/// Tree Linter — validates passive tree data files.
///
/// Usage: tree_linter <tree_file_or_dir> [--strict]
///
/// Errors fail the run. Warnings fail it only with `--strict`.

use passive_tree::core::definition::{BoardDefinition, TreeDefinition};
use passive_tree::core::tree::Tree;
use passive_tree::schema::board::{Board, BoardKind};
use passive_tree::schema::node::{NodeKind, ROOT_NODE_ID};
use std::path::{Path, PathBuf};
use std::process;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "passive_tree=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 || args[1] == "--help" || args[1] == "-h" {
        println!("Usage: tree_linter <tree_file_or_dir> [--strict]");
        process::exit(0);
    }

    let target = Path::new(&args[1]);
    let strict = args[2..].iter().any(|a| a == "--strict");

    let files = if target.is_file() {
        vec![target.to_path_buf()]
    } else if target.is_dir() {
        let mut found = Vec::new();
        collect_ron_files(target, &mut found);
        found.sort();
        found
    } else {
        eprintln!("ERROR: Path '{}' does not exist", target.display());
        process::exit(1);
    };

    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    for path in &files {
        match TreeDefinition::load_from_ron(path) {
            Ok(def) => {
                println!("  Loaded: {}", path.display());
                lint_tree(path, &def, &mut errors, &mut warnings);
            }
            Err(e) => errors.push(format!("{}: failed to load: {}", path.display(), e)),
        }
    }

    println!("\n=== Tree Lint Report ===\n");

    if errors.is_empty() && warnings.is_empty() {
        println!("All checks passed!");
    }

    for warning in &warnings {
        println!("WARNING: {}", warning);
    }

    for error in &errors {
        println!("ERROR: {}", error);
    }

    println!(
        "\nSummary: {} files, {} errors, {} warnings",
        files.len(),
        errors.len(),
        warnings.len()
    );

    if errors.is_empty() && !(strict && !warnings.is_empty()) {
        process::exit(0);
    } else {
        process::exit(1);
    }
}

fn collect_ron_files(dir: &Path, out: &mut Vec<PathBuf>) {
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                collect_ron_files(&path, out);
            } else if path.extension().and_then(|s| s.to_str()) == Some("ron") {
                out.push(path);
            }
        }
    }
}

fn lint_tree(path: &Path, def: &TreeDefinition, errors: &mut Vec<String>, warnings: &mut Vec<String>) {
    let file = path.display();

    if def.core.kind != BoardKind::Core {
        errors.push(format!("{}: core board '{}' is not of kind Core", file, def.core.id));
    }
    if !def.core.nodes.iter().any(|n| n.id == ROOT_NODE_ID) {
        errors.push(format!("{}: core board has no '{}' node", file, ROOT_NODE_ID));
    }
    if def.max_connected_boards == 0 && !def.boards.is_empty() {
        warnings.push(format!(
            "{}: max_connected_boards is 0, so no board can ever be attached",
            file
        ));
    }

    let mut built = Vec::new();
    for board_def in def.all_boards() {
        lint_definition(&file.to_string(), board_def, warnings);
        match board_def.build() {
            Ok(board) => {
                lint_board(&file.to_string(), &board, errors, warnings);
                built.push(board);
            }
            Err(e) => errors.push(format!("{}: {}", file, e)),
        }
    }

    // Cross-board checks need every board to have built.
    if built.len() == def.boards.len() + 1 {
        if let Err(e) = Tree::from_definition(def) {
            errors.push(format!("{}: {}", file, e));
        }
        let point_count: usize = built.iter().map(|b| b.extension_points.len()).sum();
        if !def.boards.is_empty() && point_count == 0 {
            warnings.push(format!(
                "{}: {} attachable boards but no extension points",
                file,
                def.boards.len()
            ));
        }
    }
}

fn lint_definition(file: &str, def: &BoardDefinition, warnings: &mut Vec<String>) {
    for node in &def.nodes {
        let payoff = matches!(node.kind, NodeKind::Notable | NodeKind::Keystone);
        if payoff && node.modifiers.is_empty() {
            warnings.push(format!(
                "{}: board '{}': {:?} node '{}' has no modifiers",
                file, def.id, node.kind, node.id
            ));
        }
        if node.kind == NodeKind::Travel && !node.modifiers.is_empty() {
            warnings.push(format!(
                "{}: board '{}': travel node '{}' grants stats",
                file, def.id, node.id
            ));
        }
        if node.cost == 0 && node.id != ROOT_NODE_ID {
            warnings.push(format!(
                "{}: board '{}': node '{}' costs nothing",
                file, def.id, node.id
            ));
        }
        if node.max_rank == 0 {
            warnings.push(format!(
                "{}: board '{}': node '{}' has max_rank 0, treated as 1",
                file, def.id, node.id
            ));
        }
    }
}

fn lint_board(file: &str, board: &Board, errors: &mut Vec<String>, warnings: &mut Vec<String>) {
    let mains = board.main_nodes();
    if mains.is_empty() {
        errors.push(format!("{}: board '{}' has no main node", file, board.id));
    } else if mains.len() > 1 {
        warnings.push(format!(
            "{}: board '{}' has {} main nodes",
            file,
            board.id,
            mains.len()
        ));
    }

    for id in board.unreachable_nodes() {
        errors.push(format!(
            "{}: board '{}': node '{}' cannot be reached from a main node",
            file, board.id, id
        ));
    }

    for (a, b) in board.non_orthogonal_edges() {
        warnings.push(format!(
            "{}: board '{}': edge '{}' - '{}' joins non-adjacent cells",
            file, board.id, a, b
        ));
    }

    for point in &board.extension_points {
        if let Some(node) = board.node_at(point.position) {
            warnings.push(format!(
                "{}: board '{}': extension point '{}' shares {} with node '{}'",
                file, board.id, point.id, point.position, node.id
            ));
        }
    }

    if board.kind == BoardKind::Keystone {
        let has_drawback = board
            .nodes()
            .flat_map(|n| n.modifiers.values())
            .any(|v| *v < 0.0);
        if !has_drawback {
            warnings.push(format!(
                "{}: keystone board '{}' has no drawback modifier",
                file, board.id
            ));
        }
    }
}
