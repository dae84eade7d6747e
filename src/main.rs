use clap::{Parser, Subcommand};
use env_logger::Builder;
use log::{error, info, LevelFilter};
use memmap2::Mmap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process;

use iatswap::pe::{ImportBinding, ImportDescriptors, ModuleView};

#[cfg(target_os = "windows")]
use iatswap::redirect::RedirectSession;
#[cfg(target_os = "windows")]
use iatswap::resolve::LibraryResolver;
#[cfg(target_os = "windows")]
use std::ffi::CString;
#[cfg(target_os = "windows")]
use std::sync::Arc;
#[cfg(target_os = "windows")]
use windows::{core::PCSTR, Win32::System::LibraryLoader::GetModuleHandleA};

/// iatswap
/// Runtime import-table redirection for loaded PE modules
#[derive(Parser)]
#[command(name = "iatswap")]
#[command(version = "0.1.0")]
#[command(about = "Runtime import-table redirection for loaded PE modules", long_about = None)]
struct Args {
    /// Subcommands for different operations
    #[command(subcommand)]
    command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// List the imports of a PE file on disk
    Inspect {
        /// Input PE file path
        #[arg(short, long, value_name = "FILE")]
        input: PathBuf,

        /// Only show imports taken from this library
        #[arg(short, long, value_name = "NAME")]
        library: Option<String>,
    },

    /// Redirect a loaded module's imports to a replacement library
    Patch {
        /// Target module name (defaults to the process image)
        #[arg(short, long, value_name = "NAME")]
        module: Option<String>,

        /// Provider library whose imports get redirected
        #[arg(short, long, value_name = "NAME")]
        provider: String,

        /// Replacement library supplying the new addresses
        #[arg(short, long, value_name = "FILE")]
        replacement: PathBuf,
    },
}

fn main() {
    // Parse command line arguments
    let args = Args::parse();

    // Setup logger based on verbosity
    let mut builder = Builder::new();
    builder.filter_level(if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    });
    builder.init();

    match &args.command {
        Command::Inspect { input, library } => {
            info!("Inspecting imports of {}", input.display());

            if let Err(e) = run_inspect(input, library.as_deref()) {
                error!("Failed to inspect {}: {}", input.display(), e);
                process::exit(1);
            }
        }

        Command::Patch {
            module,
            provider,
            replacement,
        } => {
            #[cfg(target_os = "windows")]
            {
                info!(
                    "Redirecting {} imports to {}",
                    provider,
                    replacement.display()
                );

                let target = match module {
                    Some(name) => {
                        let c_name = match CString::new(name.as_str()) {
                            Ok(c_name) => c_name,
                            Err(_) => {
                                error!("Module name contains NUL: {}", name);
                                process::exit(1);
                            }
                        };
                        match unsafe {
                            GetModuleHandleA(PCSTR::from_raw(c_name.as_ptr() as *const u8))
                        } {
                            Ok(handle) => handle,
                            Err(_) => {
                                error!("Module {} is not loaded in this process", name);
                                process::exit(1);
                            }
                        }
                    }
                    None => match unsafe { GetModuleHandleA(PCSTR::null()) } {
                        Ok(handle) => handle,
                        Err(e) => {
                            error!("Cannot locate the process image: {}", e);
                            process::exit(1);
                        }
                    },
                };

                // SAFETY: the handle came from the loader, so it points at a
                // mapped image of this process.
                let view = match unsafe {
                    ModuleView::from_module(target.0 as *const std::ffi::c_void)
                } {
                    Ok(view) => view,
                    Err(e) => {
                        error!("Target module is not a usable image: {}", e);
                        process::exit(1);
                    }
                };

                let resolver = match LibraryResolver::open(&replacement.to_string_lossy()) {
                    Ok(resolver) => resolver,
                    Err(e) => {
                        error!("{}", e);
                        process::exit(1);
                    }
                };
                info!("Replacement library loaded: {}", resolver.name());

                let mut session = RedirectSession::new();
                match session.patch_imports(&view, provider, Arc::new(resolver)) {
                    Ok(report) => println!("{}", report),
                    Err(e) => {
                        error!("Import redirection failed: {}", e);
                        process::exit(1);
                    }
                }
            }

            #[cfg(not(target_os = "windows"))]
            {
                let _ = (module, provider, replacement);
                error!("The patch command is only supported on Windows");
                process::exit(1);
            }
        }
    }
}

fn run_inspect(input: &Path, filter: Option<&str>) -> iatswap::pe::Result<()> {
    let file = File::open(input)?;
    // SAFETY: read-only mapping; the file handle outlives every view into it
    let mapping = unsafe { Mmap::map(&file)? };
    let view = ModuleView::from_file_bytes(&mapping)?;

    let directory = match view.import_directory()? {
        Some(directory) => directory,
        None => {
            println!("No import directory");
            return Ok(());
        }
    };

    let mut libraries = 0usize;
    let mut entries = 0usize;
    for imports in ImportDescriptors::new(&view, directory) {
        if let Some(filter) = filter {
            if !imports.matches(filter) {
                continue;
            }
        }
        libraries += 1;
        println!(
            "{} (ILT 0x{:08x}, IAT 0x{:08x})",
            imports.library,
            imports.descriptor.original_first_thunk,
            imports.descriptor.first_thunk
        );

        for site in imports.thunks(&view) {
            entries += 1;
            match &site.binding {
                Some(ImportBinding::Name { hint, name }) => {
                    println!("  0x{:08x}  {} (hint {})", site.slot_rva, name, hint)
                }
                Some(binding) => println!("  0x{:08x}  {}", site.slot_rva, binding),
                None => println!(
                    "  0x{:08x}  <does not decode: 0x{:x}>",
                    site.slot_rva, site.binding_value
                ),
            }
        }
    }

    println!();
    println!("{} import entries across {} libraries", entries, libraries);
    Ok(())
}
