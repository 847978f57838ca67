//! kmodctl - inspect and manage kernel modules
//!
//! Usage:
//!   kmodctl list                 List loaded modules
//!   kmodctl lookup <alias>       Modules matching an alias
//!   kmodctl info <name>          Show module information
//!   kmodctl versions <name>      Show symbol versions
//!   kmodctl deps <name>          Show dependencies and holders
//!   kmodctl insert <name>        Insert a module and its dependencies
//!   kmodctl remove <name>        Remove a module

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use kmod_handles::{Config, Context, InitState, ModuleHandle, ModuleInfo, output};
use owo_colors::OwoColorize;
use serde::Serialize;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "kmodctl")]
#[command(about = "Inspect, insert and remove kernel modules through libkmod")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Show debug output from the handle layer
    #[arg(short, long, global = true, env = "KMODCTL_VERBOSE")]
    verbose: bool,

    /// Read settings from this file instead of the XDG search path
    #[arg(short, long, global = true, env = "KMODCTL_CONFIG")]
    config: Option<PathBuf>,

    /// Module search directory (defaults to /lib/modules/`uname -r`)
    #[arg(short = 'd', long, global = true, env = "KMODCTL_MODULE_DIR")]
    module_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// List loaded modules
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show every module matching an alias
    Lookup {
        /// Alias, module name or modalias pattern
        alias: String,
    },

    /// Show module information
    Info {
        /// Module name
        name: String,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Show the symbol versions a module was built against
    Versions {
        /// Module name
        name: String,
    },

    /// Show what a module depends on and what holds it
    Deps {
        /// Module name
        name: String,
    },

    /// Insert a module together with its dependencies
    Insert {
        /// Module name or alias
        name: String,
    },

    /// Remove a module from the kernel
    Remove {
        /// Module name or alias
        name: String,
    },
}

#[derive(Serialize)]
struct ModuleSummary {
    name: String,
    size: u64,
    refcnt: i32,
}

impl ModuleSummary {
    fn of(module: &ModuleHandle) -> Self {
        Self {
            name: module.name(),
            size: module.size(),
            refcnt: module.refcnt(),
        }
    }
}

#[derive(Serialize)]
struct ModuleDetails {
    name: String,
    path: String,
    size: u64,
    refcnt: i32,
    init_state: Option<InitState>,
    options: String,
    install_commands: String,
    remove_commands: String,
    info: ModuleInfo,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        kmod_handles::log::set_verbose(true);
    }

    let config = load_config(cli.config.as_deref(), cli.module_dir)?;
    let ctx = Context::with_config(&config).context("Failed to open the module context")?;

    match cli.command {
        Commands::List { json } => list_modules(&ctx, json)?,

        Commands::Lookup { alias } => {
            let matches = ctx.lookup(&alias)?;
            if matches.is_empty() {
                output::info(&format!("No module matches {}", alias.bold()));
            } else {
                output::info(&format!("Modules matching {}:", alias.bold()));
                for module in &matches {
                    println!("  {} {}", "-".cyan(), module.name());
                }
            }
        }

        Commands::Info { name, json } => {
            let module = ctx.module_from_name(&name)?;
            show_info(&module, json)?;
        }

        Commands::Versions { name } => {
            let module = ctx.module_from_name(&name)?;
            let versions = module
                .versions()
                .with_context(|| format!("Failed to read symbol versions of {}", name))?;
            output::info(&format!("Symbol versions for {}:", name.bold()));
            if versions.is_empty() {
                println!("  {}", "(none)".dimmed());
            }
            for version in &versions {
                println!("  0x{:016x}  {}", version.crc(), version.symbol());
            }
        }

        Commands::Deps { name } => {
            let module = ctx.module_from_name(&name)?;
            print_names(&format!("Dependencies of {}:", name.bold()), &module.dependencies());
            print_names("Held by:", &module.holders());
        }

        Commands::Insert { name } => {
            output::action(&format!("Inserting {}", name));
            let pb = output::spinner(&format!("probing {}", name));
            match ctx.insert(&name) {
                Ok(0) => {
                    output::progress_fail(pb, &format!("{} not found", name));
                    output::warning(&format!("No module matches {}", name));
                    anyhow::bail!("nothing to insert: no module matches {}", name);
                }
                Ok(_) => output::progress_success(pb, &format!("{} inserted", name)),
                Err(e) => {
                    output::progress_fail(pb, &format!("{} failed", name));
                    return Err(e.into());
                }
            }
        }

        Commands::Remove { name } => {
            output::action(&format!("Removing {}", name));
            let pb = output::spinner(&format!("removing {}", name));
            match ctx.remove(&name) {
                Ok(0) => {
                    output::progress_fail(pb, &format!("{} not found", name));
                    output::warning(&format!("No module matches {}", name));
                    anyhow::bail!("nothing to remove: no module matches {}", name);
                }
                Ok(_) => output::progress_success(pb, &format!("{} removed", name)),
                Err(e) => {
                    output::progress_fail(pb, &format!("{} failed", name));
                    return Err(e.into());
                }
            }
        }
    }

    Ok(())
}

/// Explicit file wins over the XDG search path; the flag wins over both.
fn load_config(path: Option<&std::path::Path>, module_dir: Option<PathBuf>) -> Result<Config> {
    let mut config = match path {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };
    if module_dir.is_some() {
        config.module_dir = module_dir;
    }
    Ok(config)
}

fn list_modules(ctx: &Context, json: bool) -> Result<()> {
    let modules = ctx.list()?;

    if json {
        let summaries: Vec<ModuleSummary> = modules.iter().map(ModuleSummary::of).collect();
        println!("{}", serde_json::to_string_pretty(&summaries)?);
        return Ok(());
    }

    if modules.is_empty() {
        output::info("No modules loaded");
        return Ok(());
    }

    println!(
        "  {} {}  {}",
        format!("{:<24}", "Module").bold(),
        format!("{:>10}", "Size").bold(),
        "Used".bold()
    );
    for module in &modules {
        output::module_row(&module.name(), module.size(), module.refcnt());
    }
    Ok(())
}

fn show_info(module: &ModuleHandle, json: bool) -> Result<()> {
    let name = module.name();
    let info = module
        .info()
        .with_context(|| format!("Failed to read module info of {}", name))?;
    let init_state = match module.init_state() {
        Ok(state) => Some(state),
        Err(e) => {
            if !json {
                output::warning(&e.to_string());
            }
            None
        }
    };

    if json {
        let details = ModuleDetails {
            name,
            path: module.path(),
            size: module.size(),
            refcnt: module.refcnt(),
            init_state,
            options: module.options(),
            install_commands: module.install_commands(),
            remove_commands: module.remove_commands(),
            info,
        };
        println!("{}", serde_json::to_string_pretty(&details)?);
        return Ok(());
    }

    output::info(&format!("Module {}", name.bold()));
    let width = info
        .keys()
        .iter()
        .map(|k| k.len())
        .chain(["install commands".len()])
        .max()
        .unwrap_or(0);

    output::field("path", &module.path(), width);
    output::field("size", &module.size().to_string(), width);
    output::field("refcnt", &module.refcnt().to_string(), width);
    if let Some(state) = &init_state {
        output::field("state", &state.to_string(), width);
    }
    for (key, value) in [
        ("options", module.options()),
        ("install commands", module.install_commands()),
        ("remove commands", module.remove_commands()),
    ] {
        if !value.is_empty() {
            output::field(key, &value, width);
        }
    }
    for (key, value) in info.entries() {
        output::field(key, value, width);
    }
    if info.is_empty() {
        output::detail("no .modinfo entries");
    }
    Ok(())
}

fn print_names(header: &str, modules: &kmod_handles::ModuleList) {
    output::info(header);
    if modules.is_empty() {
        println!("  {}", "(none)".dimmed());
    }
    for module in modules {
        println!("  {} {}", "-".cyan(), module.name());
    }
}
