use anyhow::Context;
use clap::Parser;
use deptree::pe::demangle_symbol;
use deptree::{
    decanonicalize, path_to_string, readable_canonical_path, BinaryReader, DependencyTree,
    ImportedSymbol, LookupPath, LookupQuery, NodeId, PeReader, WindowsSystem,
};
use fs_err as fs;
use std::path::PathBuf;

/// ldd-style dependency tree inspection for Windows executables
#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Target file (.exe or .dll)
    input: PathBuf,

    /// Path for output in JSON format
    #[arg(short = 'j', long, value_name = "OUTPUT_JSON_PATH")]
    output_json_path: Option<PathBuf>,

    /// Maximum recursion depth (default: unlimited)
    #[arg(short = 'd', long, value_name = "MAX_DEPTH")]
    max_depth: Option<usize>,

    /// Working directory to be considered in the DLL lookup path
    /// (default: the directory of the target)
    #[arg(short = 'k', long, value_name = "WORKDIR")]
    workdir: Option<PathBuf>,

    /// Additional ';'-separated directories to be considered in the DLL lookup path
    #[arg(short = 'a', long, value_name = "PATH")]
    userpath: Option<String>,

    /// Windows partition to use for system DLL lookup (if not specified, the
    /// partition where INPUT lies will be tested and used if valid)
    #[arg(short = 'w', long, value_name = "WINDOWS_ROOT")]
    windows_root: Option<PathBuf>,

    /// Include system DLLs in the output
    #[arg(long)]
    print_system_dlls: bool,

    /// Print the demangled import and export lists of the target
    #[arg(long)]
    symbols: bool,

    /// Verbosity level
    #[arg(short, long)]
    verbose: bool,
}

fn visit_depth_first(tree: &DependencyTree, id: NodeId, print_system_dlls: bool) {
    let node = tree.node(id);
    if node.is_system() && !print_system_dlls {
        return;
    }

    let folder = if !node.found {
        "not found".to_owned()
    } else {
        node.full_path
            .as_deref()
            .and_then(|p| p.parent())
            .map(|p| decanonicalize(&path_to_string(p)))
            .unwrap_or_else(|| "INVALID".to_owned())
    };
    println!("{}{} => {}", "\t".repeat(node.depth), node.module_name, folder);

    for &child in tree.children(id) {
        visit_depth_first(tree, child, print_system_dlls);
    }
}

fn print_symbols(tree: &mut DependencyTree) -> anyhow::Result<()> {
    let root = tree.root();
    let details = tree.ensure_details(root)?.clone();

    println!("\nImports:");
    for module in &details.imports {
        println!("\t{}", module.name);
        for symbol in &module.symbols {
            match symbol {
                ImportedSymbol::ByName { name, .. } => {
                    println!("\t\t{}", demangle_symbol(name).unwrap_or_else(|_| name.clone()))
                }
                ImportedSymbol::ByOrdinal { ordinal, .. } => {
                    println!("\t\tordinal {}", ordinal)
                }
            }
        }
    }

    println!("\nExports:");
    for export in &details.exports {
        match &export.name {
            Some(name) => {
                println!("\t{}", demangle_symbol(name).unwrap_or_else(|_| name.clone()))
            }
            None => println!("\t<unnamed> (rva {:#x})", export.rva),
        }
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if !args.input.exists() {
        eprintln!(
            "Specified file not found at {}\nCurrent working directory: {}",
            args.input.display(),
            std::env::current_dir()?.display(),
        );
        std::process::exit(1);
    }

    if args.input.is_dir() {
        eprintln!(
            "The specified path is a directory, not a PE executable file: {}",
            args.input.display(),
        );
        std::process::exit(1);
    }

    let binary_path = fs::canonicalize(&args.input)?;

    let mut query = LookupQuery::deduce_from_executable_location(&binary_path)?;
    query.parameters.max_depth = args.max_depth;

    // overrides (must be last)

    if let Some(overridden_root) = &args.windows_root {
        query.system = WindowsSystem::from_root(overridden_root);
        if query.system.is_none() {
            eprintln!(
                "No Windows installation found under {}",
                overridden_root.display()
            );
        }
    } else if args.verbose {
        match &query.system {
            Some(system) => println!(
                "Windows partition root not specified, assumed {}",
                path_to_string(&system.sys_dir)
            ),
            None => println!(
                "Windows partition root not specified, and executable doesn't lie in one; \
                 system DLL imports will not be resolved"
            ),
        }
    }

    if let Some(overridden_workdir) = &args.workdir {
        query.target.working_dir = fs::canonicalize(overridden_workdir)?;
    }

    if let Some(overridden_path) = &args.userpath {
        let canonicalized_path: Vec<PathBuf> = overridden_path
            .split(';')
            .filter_map(|s| {
                if std::path::Path::new(s).exists() {
                    Some(fs::canonicalize(s))
                } else {
                    eprintln!("Skipping non-existing path entry {}", s);
                    None
                }
            })
            .collect::<Result<Vec<_>, std::io::Error>>()?;
        query.target.user_path.extend(canonicalized_path);
    }

    let reader = PeReader::new();
    let bitness = reader
        .probe_bitness(&binary_path)
        .context("the target is not a readable PE file")?;
    let lookup_path = LookupPath::deduce(&query, bitness);

    if args.verbose {
        println!(
            "Looking for dependencies of binary {} ({:?})",
            readable_canonical_path(&binary_path)?,
            bitness
        );
        let decanonicalized_path: Vec<String> = lookup_path
            .search_path()
            .iter()
            .map(|p| decanonicalize(&path_to_string(p)))
            .collect();
        println!("Search path: {}\n", decanonicalized_path.join(", "));
    }

    let mut tree = deptree::build_tree(&query, &lookup_path, Box::new(reader))?;

    println!();
    visit_depth_first(&tree, tree.root(), args.print_system_dlls);

    if !tree.missing_modules().is_empty() {
        let mut missing: Vec<&str> = tree.missing_modules().iter().map(String::as_str).collect();
        missing.sort_unstable();
        println!("\nMissing modules: {}", missing.join(", "));
    }

    if args.symbols {
        print_symbols(&mut tree)?;
    }

    if let Some(json_output_path) = &args.output_json_path {
        let nodes: Vec<_> = tree.nodes().map(|(_, n)| n).collect();
        let js = serde_json::to_string(&nodes).context("Error serializing")?;
        fs::write(json_output_path, js.as_bytes())
            .context(format!("couldn't write to {}", json_output_path.display()))?;

        if args.verbose {
            println!("successfully wrote to {}", json_output_path.display());
        }
    }

    Ok(())
}
