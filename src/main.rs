//! Drop-in `cc` replacement that routes allocator calls through
//! allocation-site tracking stubs.

#[macro_use]
extern crate log;
extern crate allocs_wrap;
extern crate env_logger;

use allocs_wrap::symbols::BinutilsEditor;
use allocs_wrap::tools::{Compiler, LiballocsTools};
use allocs_wrap::{Config, Driver, WrappedSymbolSet};

use log::LevelFilter;

use std::env;
use std::process::exit;

fn run(args: Vec<String>) -> allocs_wrap::Result<()> {
    let config = Config::from_env();

    let mut logger = env_logger::Builder::from_default_env();
    if config.debug {
        logger.filter_level(LevelFilter::Debug);
    }
    logger.init();

    debug!("called with args {}", args.join(" "));

    let symbols = WrappedSymbolSet::parse(&config.descriptors)?;
    let compiler = Compiler::discover(&config)?;
    let editor = BinutilsEditor::new(&config.objcopy, &config.ld);
    let tools = LiballocsTools::new(&config);

    Driver::new(&config, &symbols, &compiler, &editor, &tools).run(args)
}

fn main() {
    // usually names this very wrapper; the builds we start must not recurse
    env::remove_var("CC");

    let args: Vec<String> = env::args_os()
        .skip(1)
        .map(|a| a.to_string_lossy().into_owned())
        .collect();

    if let Err(e) = run(args) {
        eprintln!("allocscc: {}", e);
        exit(e.exit_code()); // -1 for a signalled subprocess
    }
}
