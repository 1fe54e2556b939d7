//! swiftdex - Dump Swift runtime metadata from Mach-O binaries.
//!
//! Lists type, protocol and conformance descriptors from a standalone Mach-O
//! file or from an image inside a dyld shared cache.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rayon::prelude::*;
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use swiftdex::descriptor::{ConformingType, SwiftSection};
use swiftdex::dyld::uuid_to_string;
use swiftdex::{
    ContextDescriptor, ContextDescriptorWrapper, MachOFile, OpenOptions,
    ProtocolConformanceDescriptor, ProtocolDescriptor, SharedCache, SwiftSections,
    SymbolCache, SymbolOrElement, TypeContextDescriptor,
};

/// Dump Swift runtime metadata from Mach-O binaries.
#[derive(Parser, Debug)]
#[command(name = "swiftdex")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbosity (-v info, -vv debug, -vvv trace). RUST_LOG overrides it.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Number of parallel jobs (default: number of CPUs)
    #[arg(short, long, global = true)]
    jobs: Option<usize>,
}

/// Selects the binary to read.
#[derive(clap::Args, Debug)]
struct Target {
    /// Mach-O file, or dyld shared cache when --image is given
    path: PathBuf,

    /// Image inside the shared cache (e.g. "Foundation" or its full path)
    #[arg(short, long)]
    image: Option<String>,

    /// Architecture slice of a fat binary (substring match: "arm64" matches "arm64e")
    #[arg(short, long)]
    arch: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show the binary's identity and Swift sections
    Info {
        #[command(flatten)]
        target: Target,
    },

    /// List type descriptors from __swift5_types
    Types {
        #[command(flatten)]
        target: Target,

        /// Print field names of each type
        #[arg(short, long)]
        fields: bool,
    },

    /// List protocol descriptors from __swift5_protos
    Protocols {
        #[command(flatten)]
        target: Target,
    },

    /// List protocol conformances from __swift5_proto
    Conformances {
        #[command(flatten)]
        target: Target,
    },

    /// Look up symbols by offset, or offsets by symbol name
    Symbol {
        #[command(flatten)]
        target: Target,

        /// Offset (hex, e.g. 0x4000) or, with --name, a symbol name
        query: String,

        /// Treat the query as a symbol name
        #[arg(short, long)]
        name: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    if let Some(n) = cli.jobs {
        rayon::ThreadPoolBuilder::new()
            .num_threads(n)
            .build_global()
            .ok();
    }

    match cli.command {
        Commands::Info { target } => cmd_info(&target),
        Commands::Types { target, fields } => cmd_types(&target, fields),
        Commands::Protocols { target } => cmd_protocols(&target),
        Commands::Conformances { target } => cmd_conformances(&target),
        Commands::Symbol {
            target,
            query,
            name,
        } => cmd_symbol(&target, &query, name),
    }
}

fn setup_logging(verbosity: u8) {
    if std::env::var_os("RUST_LOG").is_some() {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(EnvFilter::from_default_env())
            .with_target(false)
            .without_time()
            .finish();
        tracing::subscriber::set_global_default(subscriber).ok();
        return;
    }

    let level = match verbosity {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .without_time()
        .finish();

    tracing::subscriber::set_global_default(subscriber).ok();
}

/// Opens the binary a target names.
fn open_target(target: &Target) -> Result<MachOFile> {
    let mut options = OpenOptions::default();
    if let Some(arch) = &target.arch {
        options = options.architecture(arch.clone());
    }

    let start = Instant::now();
    let file = match &target.image {
        Some(image) => {
            let cache = Arc::new(
                SharedCache::open_with(&target.path, &options)
                    .with_context(|| format!("Failed to open cache: {}", target.path.display()))?,
            );
            MachOFile::from_cache(cache, image)
                .with_context(|| format!("Image not found: {image}"))?
        }
        None => MachOFile::open_with(&target.path, &options)
            .with_context(|| format!("Failed to open: {}", target.path.display()))?,
    };
    info!(
        "Opened {} in {:.2}s",
        target.path.display(),
        start.elapsed().as_secs_f64()
    );
    Ok(file)
}

/// Placeholder printed in place of an entry that failed to decode.
fn placeholder(err: &swiftdex::Error) -> String {
    if !err.is_recoverable() {
        warn!("{err}");
    }
    format!("<error: {err}>")
}

fn cmd_info(target: &Target) -> Result<()> {
    let file = open_target(target)?;
    let macho = file.macho();

    println!("Swift Metadata Information");
    println!("==========================");
    println!("Path:          {}", file.path().display());
    if let Some(name) = macho.install_name() {
        println!("Install name:  {name}");
    }
    if let Some(uuid) = macho.uuid() {
        println!("UUID:          {}", uuid_to_string(&uuid));
    }
    println!("arm64e:        {}", macho.is_arm64e());
    println!("Cache image:   {}", file.is_cache_resident());

    let dependencies: Vec<&str> = macho.dependencies().collect();
    if !dependencies.is_empty() {
        println!("\nDependencies:");
        for dependency in dependencies {
            println!("  {dependency}");
        }
    }

    println!("\nSections:");
    for section in [
        SwiftSection::Types,
        SwiftSection::Protocols,
        SwiftSection::Conformances,
        SwiftSection::AssociatedTypes,
        SwiftSection::FieldMetadata,
    ] {
        match file.swift_section(section)? {
            Some((start, size)) => {
                println!("  {:<18} {:#010x} ({} bytes)", section.name(), start, size)
            }
            None => println!("  {:<18} -", section.name()),
        }
    }

    Ok(())
}

fn cmd_types(target: &Target, fields: bool) -> Result<()> {
    let file = open_target(target)?;
    let entries = file.types()?;

    let lines: Vec<String> = entries
        .par_iter()
        .map(|entry| match entry {
            Ok(SymbolOrElement::Element(descriptor)) => describe_type(&file, descriptor, fields),
            Ok(SymbolOrElement::Symbol(symbol)) => format!("external   {symbol}"),
            Err(err) => placeholder(err),
        })
        .collect();

    for line in &lines {
        println!("{line}");
    }
    info!("{} types", lines.len());
    Ok(())
}

fn describe_type(file: &MachOFile, descriptor: &ContextDescriptorWrapper<u64>, fields: bool) -> String {
    let name = descriptor
        .qualified_name(file)
        .unwrap_or_else(|err| placeholder(&err));
    let mut line = format!(
        "{:#010x} {:<9} {name}",
        descriptor.address(),
        descriptor.kind().name()
    );

    if let Some(class) = descriptor.as_class() {
        match class.superclass_type(file) {
            Ok(Some(superclass)) => line.push_str(&format!(" : {superclass}")),
            Ok(None) => {}
            Err(err) => line.push_str(&format!(" : {}", placeholder(&err))),
        }
        if class.vtable_size() > 0 {
            line.push_str(&format!(" [{} methods]", class.vtable_size()));
        }
    }

    if fields {
        let descriptor_fields = match descriptor {
            ContextDescriptorWrapper::Class(d) => d.field_descriptor(file),
            ContextDescriptorWrapper::Struct(d) => d.field_descriptor(file),
            ContextDescriptorWrapper::Enum(d) => d.field_descriptor(file),
            _ => Ok(None),
        };
        match descriptor_fields.and_then(|fd| fd.map(|fd| fd.field_names(file)).transpose()) {
            Ok(Some(names)) => {
                for field in names {
                    line.push_str(&format!("\n    {field}"));
                }
            }
            Ok(None) => {}
            Err(err) => line.push_str(&format!("\n    {}", placeholder(&err))),
        }
    }

    line
}

fn cmd_protocols(target: &Target) -> Result<()> {
    let file = open_target(target)?;
    let entries = file.protocols()?;

    let lines: Vec<String> = entries
        .par_iter()
        .map(|entry| match entry {
            Ok(SymbolOrElement::Element(protocol)) => describe_protocol(&file, protocol),
            Ok(SymbolOrElement::Symbol(symbol)) => format!("external   {symbol}"),
            Err(err) => placeholder(err),
        })
        .collect();

    for line in &lines {
        println!("{line}");
    }
    info!("{} protocols", lines.len());
    Ok(())
}

fn describe_protocol(file: &MachOFile, protocol: &ProtocolDescriptor<u64>) -> String {
    let name = ContextDescriptorWrapper::Protocol(protocol.clone())
        .qualified_name(file)
        .unwrap_or_else(|err| placeholder(&err));
    let mut line = format!(
        "{:#010x} {name} ({} requirements)",
        protocol.address(),
        protocol.requirements.len()
    );
    match protocol.associated_type_names(file) {
        Ok(names) if !names.is_empty() => {
            line.push_str(&format!(" associatedtypes: {}", names.join(", ")))
        }
        Ok(_) => {}
        Err(err) => line.push_str(&format!(" {}", placeholder(&err))),
    }
    line
}

fn cmd_conformances(target: &Target) -> Result<()> {
    let file = open_target(target)?;
    let entries = file.conformances()?;

    let lines: Vec<String> = entries
        .par_iter()
        .map(|entry| match entry {
            Ok(SymbolOrElement::Element(conformance)) => describe_conformance(&file, conformance),
            Ok(SymbolOrElement::Symbol(symbol)) => format!("external   {symbol}"),
            Err(err) => placeholder(err),
        })
        .collect();

    for line in &lines {
        println!("{line}");
    }
    info!("{} conformances", lines.len());
    Ok(())
}

fn describe_conformance(file: &MachOFile, conformance: &ProtocolConformanceDescriptor<u64>) -> String {
    let conforming = match conformance.type_reference(file) {
        Ok(ConformingType::Descriptor(SymbolOrElement::Element(descriptor))) => descriptor
            .qualified_name(file)
            .unwrap_or_else(|err| placeholder(&err)),
        Ok(ConformingType::Descriptor(SymbolOrElement::Symbol(symbol))) => symbol.name,
        Ok(ConformingType::ObjCClassName(name)) => name,
        Ok(ConformingType::ObjCClass(SymbolOrElement::Symbol(symbol))) => symbol.name,
        Ok(ConformingType::ObjCClass(SymbolOrElement::Element(address))) => {
            format!("<objc class {address:#x}>")
        }
        Ok(ConformingType::Unknown(kind)) => format!("<type reference kind {kind}>"),
        Err(err) => placeholder(&err),
    };

    let protocol = match conformance.protocol(file) {
        Ok(Some(SymbolOrElement::Element(protocol))) => protocol
            .name(file)
            .unwrap_or_else(|err| placeholder(&err)),
        Ok(Some(SymbolOrElement::Symbol(symbol))) => symbol.name,
        Ok(None) => "<null>".to_string(),
        Err(err) => placeholder(&err),
    };

    let mut line = format!("{:#010x} {conforming}: {protocol}", conformance.address());
    if conformance.retroactive_context.is_some() {
        line.push_str(" (retroactive)");
    }
    if conformance.global_actor_reference.is_some() {
        line.push_str(" (global actor)");
    }
    line
}

fn cmd_symbol(target: &Target, query: &str, by_name: bool) -> Result<()> {
    let file = open_target(target)?;
    let cache = SymbolCache::shared();

    if by_name {
        let offsets = cache.offsets_of(&file, query)?;
        if offsets.is_empty() {
            bail!("Symbol not found: {query}");
        }
        for offset in offsets {
            println!("{offset:#x}");
        }
        return Ok(());
    }

    let digits = query.trim_start_matches("0x").trim_start_matches("0X");
    let offset = u64::from_str_radix(digits, 16)
        .with_context(|| format!("Invalid offset: {query}"))?;

    let symbols = cache.lookup(&file, offset)?;
    if symbols.is_empty() {
        println!("No symbol at {offset:#x}");
    }
    for symbol in symbols {
        println!("{offset:#x}  {}", symbol.name);
    }
    Ok(())
}
