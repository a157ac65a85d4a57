//! memscope: run one analysis command against a raw physical memory dump.
//!
//! The dump is mapped read-only and served as physical memory. Virtual
//! reads go through the page tables found in the dump, using the directory
//! base and control registers given on the command line. Symbols and field
//! offsets come from an ISF file. The report goes to stdout; logs go to
//! stderr (`RUST_LOG`, default `info`).

use anyhow::Context;
use clap::Parser;
use isf::IsfSymbols;
use memscope::address::parse_address;
use memscope::commands;
use memscope::memory::layers::MmapFileLayer;
use memscope::memory::virtual_memory::TranslatedMemory;
use memscope::memory::{Debuggee, Machine, MemoryLayer, ProcessorTypes, SymbolResolver, ThreadInfo};
use memscope::paging::{PagingMode, PagingTranslator, MSR_EFER};
use memscope::Session;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn parse_hex(text: &str) -> Result<u64, String> {
    parse_address(text).ok_or_else(|| format!("'{}' is not a hex address", text))
}

fn parse_pointer_size(text: &str) -> Result<u8, String> {
    match text {
        "4" => Ok(4),
        "8" => Ok(8),
        _ => Err(format!("pointer size must be 4 or 8, got '{}'", text)),
    }
}

/// Reconstruct PE images, page-table walks and kernel trees from a memory dump
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Raw physical memory dump (file offset = physical address)
    #[arg(long)]
    image: PathBuf,

    /// ISF symbol file (.json or .json.xz) for field offsets and symbol names
    #[arg(long)]
    isf: Option<PathBuf>,

    /// Load address the ISF symbols are relocated to
    #[arg(long, value_parser = parse_hex)]
    kernel_base: Option<u64>,

    /// Page directory base (CR3)
    #[arg(long, value_parser = parse_hex)]
    dtb: Option<u64>,

    /// Assume PAE paging for a 32-bit target given only --dtb
    #[arg(long, default_value_t = false)]
    pae: bool,

    /// CR0 value; with --dtb and --cr4 the paging mode is inferred from registers
    #[arg(long, value_parser = parse_hex)]
    cr0: Option<u64>,

    #[arg(long, value_parser = parse_hex)]
    cr4: Option<u64>,

    /// IA32_EFER value
    #[arg(long, value_parser = parse_hex)]
    efer: Option<u64>,

    /// Target pointer size in bytes (defaults to the ISF's, else 8)
    #[arg(long, value_parser = parse_pointer_size)]
    pointer_size: Option<u8>,

    /// PEB of the current process
    #[arg(long, value_parser = parse_hex)]
    peb: Option<u64>,

    /// TEB of the current thread
    #[arg(long, value_parser = parse_hex)]
    teb: Option<u64>,

    /// Thread id of the current thread
    #[arg(long, value_parser = parse_hex, default_value = "0")]
    tid: u64,

    /// The current process is a 32-bit process on a 64-bit kernel
    #[arg(long, default_value_t = false)]
    wow64: bool,

    /// Print structured results as JSON
    #[arg(long, default_value_t = false)]
    json: bool,

    /// Command to run (`help` lists them)
    command: String,

    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

/// Collaborators backed by command-line state and an optional ISF file.
struct DumpHost {
    symbols: Option<IsfSymbols>,
    pointer_64: bool,
    processor: ProcessorTypes,
    cr0: Option<u64>,
    cr3: Option<u64>,
    cr4: Option<u64>,
    efer: Option<u64>,
    peb: Option<u64>,
    thread: Option<ThreadInfo>,
}

impl DumpHost {
    fn from_cli(cli: &Cli) -> anyhow::Result<Self> {
        let symbols = match &cli.isf {
            Some(path) => {
                let mut symbols = isf::parse_isf_file(path)
                    .with_context(|| format!("loading ISF {}", path.display()))?;
                if let Some(base) = cli.kernel_base {
                    symbols.relocate(base);
                }
                info!(
                    "Loaded {} types and {} symbols from {}",
                    symbols.user_types.len(),
                    symbols.symbols.len(),
                    path.display()
                );
                Some(symbols)
            }
            None => None,
        };

        let pointer_size = cli
            .pointer_size
            .map(usize::from)
            .or_else(|| symbols.as_ref().map(|s| s.pointer_size))
            .unwrap_or(8);
        let pointer_64 = pointer_size == 8;
        let processor = if cli.wow64 {
            ProcessorTypes {
                actual: Machine::Amd64,
                effective: Machine::I386,
            }
        } else {
            let machine = if pointer_64 { Machine::Amd64 } else { Machine::I386 };
            ProcessorTypes {
                actual: machine,
                effective: machine,
            }
        };

        Ok(DumpHost {
            symbols,
            pointer_64,
            processor,
            cr0: cli.cr0,
            cr3: cli.dtb,
            cr4: cli.cr4,
            efer: cli.efer,
            peb: cli.peb,
            thread: cli.teb.map(|teb| ThreadInfo {
                index: 0,
                tid: cli.tid as u32,
                teb,
            }),
        })
    }
}

impl SymbolResolver for DumpHost {
    fn resolve(&self, address: u64) -> Option<(String, u64)> {
        let hit = self.symbols.as_ref()?.resolve(address)?;
        Some((hit.name, hit.displacement))
    }

    fn field_offset(&self, type_name: &str, field: &str) -> Option<u32> {
        let offset = self.symbols.as_ref()?.field_offset(type_name, field)?;
        u32::try_from(offset).ok()
    }
}

impl Debuggee for DumpHost {
    fn is_pointer_64bit(&self) -> Option<bool> {
        Some(self.pointer_64)
    }

    /// Pseudo-registers, then hex numbers, then symbol names.
    fn evaluate(&self, expression: &str) -> Option<u64> {
        let expression = expression.trim();
        match expression.to_ascii_lowercase().as_str() {
            "@cr0" => self.cr0,
            "@cr3" => self.cr3,
            "@cr4" => self.cr4,
            "@$peb" => self.peb,
            "@$teb" => self.thread.map(|t| t.teb),
            _ => parse_address(expression)
                .or_else(|| self.symbols.as_ref()?.get_symbol(expression)),
        }
    }

    fn read_msr(&self, msr: u32) -> Option<u64> {
        if msr == MSR_EFER {
            self.efer
        } else {
            None
        }
    }

    fn processor_types(&self) -> ProcessorTypes {
        self.processor
    }

    fn current_peb(&self) -> Option<u64> {
        self.peb
    }

    fn current_thread(&self) -> Option<ThreadInfo> {
        self.thread
    }

    fn threads(&self) -> Vec<ThreadInfo> {
        self.thread.into_iter().collect()
    }
}

/// Pick the translator for virtual reads. Register inference needs a
/// session, so it runs against an identity-mapped one first.
fn choose_translator(
    cli: &Cli,
    physical: &Arc<dyn MemoryLayer>,
    host: &Arc<DumpHost>,
) -> anyhow::Result<PagingTranslator> {
    let identity = Arc::new(TranslatedMemory::with_translator(
        physical.clone(),
        PagingTranslator::new(PagingMode::Disabled, 0),
    ));
    let bootstrap = Session::new(identity, host.clone(), host.clone());

    let translator = if cli.cr0.is_some() {
        PagingTranslator::from_registers(&bootstrap).context("--cr0 needs --dtb and --cr4")?
    } else if let Some(dtb) = cli.dtb {
        PagingTranslator::with_dir_base(&bootstrap, dtb, cli.pae)?
    } else {
        warn!("No --dtb given, virtual addresses are read as physical");
        PagingTranslator::new(PagingMode::Disabled, 0)
    };
    info!(
        "Paging mode {} with DirBase {:#x}",
        translator.mode().label(),
        translator.dir_base()
    );
    Ok(translator)
}

fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let layer = MmapFileLayer::open("physical", &cli.image)
        .with_context(|| format!("opening {}", cli.image.display()))?;
    info!("Opened {} ({} bytes)", cli.image.display(), layer.size());
    let physical: Arc<dyn MemoryLayer> = Arc::new(layer);

    let host = Arc::new(DumpHost::from_cli(&cli)?);
    let translator = choose_translator(&cli, &physical, &host)?;
    let memory = Arc::new(TranslatedMemory::with_translator(physical, translator));
    let session = Session::new(memory, host.clone(), host);

    let mut line = cli.command.clone();
    for arg in &cli.args {
        line.push(' ');
        line.push_str(arg);
    }

    let mut report = String::new();
    let ok = commands::run(&session, &line, cli.json, &mut report);
    print!("{}", report);
    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}
