use trcview::*;

use std::io::Write;
use std::path::PathBuf;

use clap::Parser;

/// Recover symbols and types from execution traces
#[derive(Parser, Debug)]
#[clap(about, version, author)]
enum Args {
    /// Analyze a textual trace listing
    FromListing {
        /// Path to the trace listing
        listing: PathBuf,
        /// Path to output file for the recovered symbols
        #[clap(long)]
        output_symbols: Option<PathBuf>,
        /// Path to output file for the recovered memory types
        #[clap(long)]
        output_types: Option<PathBuf>,
        /// Statically explore code from these addresses, as it is in memory at the end of the
        /// trace, before the analysis is finished
        #[clap(long, parse(try_from_str = parse_address))]
        explore: Vec<u64>,
        /// Decode straight-line code from these addresses, up to the first instruction that does
        /// not fall through
        #[clap(long, parse(try_from_str = parse_address))]
        explore_straightline: Vec<u64>,
        /// Output the register chain graph as a GraphViz `.dot` file to the given path
        #[clap(long)]
        debug_output_graphviz: Option<PathBuf>,
        /// Disable terminal logging, even for high severity alerts. Strongly discouraged for normal
        /// use.
        #[clap(long)]
        debug_disable_terminal_logging: bool,
        /// Force blocking for terminal logging. If too many messages are being spewed the logger,
        /// by default, does not block, but instead dumps a dropped-messages alert. This option
        /// forces it to block and dump even if too many are being sent.
        #[clap(long)]
        debug_forced_blocking_terminal_logging: bool,
        /// Path to send log (as JSON) to
        ///
        /// Error or higher severity alerts will still continue being shown at stderr (in addition
        /// to being added to the log)
        #[clap(long = "--log")]
        log_file: Option<PathBuf>,
        /// Debug level (repeat for more: 0-warn, 1-info, 2-debug, 3-trace)
        #[clap(short, long, parse(from_occurrences))]
        debug: usize,
        /// Advanced configuration options to tweak the analysis
        #[clap(short = 'Z', long, arg_enum)]
        advanced_config: Vec<analysis_config::CommandLineAnalysisConfig>,
    },
}

fn parse_address(s: &str) -> std::result::Result<u64, std::num::ParseIntError> {
    match s.strip_prefix("0x") {
        Some(h) => u64::from_str_radix(h, 16),
        None => s.parse(),
    }
}

/// Write to the file at `path`, or to stdout if there is none
fn output(
    path: Option<PathBuf>,
    f: impl FnOnce(&mut dyn Write) -> Result<()>,
) -> Result<()> {
    match path {
        Some(path) => {
            let mut w = std::io::BufWriter::new(std::fs::File::create(path)?);
            f(&mut w)?;
            w.flush()?;
            Ok(())
        }
        None => f(&mut std::io::stdout().lock()),
    }
}

fn main() {
    let args = Args::parse();

    match args {
        Args::FromListing {
            listing,
            output_symbols,
            output_types,
            explore,
            explore_straightline,
            debug_output_graphviz,
            debug_disable_terminal_logging,
            debug_forced_blocking_terminal_logging,
            log_file,
            debug,
            advanced_config,
        } => {
            let _log_guard = slog_scope::set_global_logger(crate::log::FileAndTermDrain::new(
                debug,
                debug_disable_terminal_logging,
                debug_forced_blocking_terminal_logging,
                log_file,
            ));

            analysis_config::AnalysisConfig::initialize(advanced_config);

            let run = || -> Result<()> {
                let lifted = trace_lifter::lift_from_file(&listing)?;
                let tree = lifted.tree;
                let mut analysis = analysis::Analysis::new(
                    Box::new(lifted.arch),
                    symbols::StaticSymbolTable::new(),
                );
                for node in lifted.order {
                    analysis.process(&tree, node)?;
                }
                for address in explore {
                    let found = analysis.explore(address, &|| false);
                    log::info!("Explored code";
                               "start" => log::Hex(address),
                               "instructions" => found.code.len(),
                               "subroutines" => found.subroutines.len());
                }
                for address in explore_straightline {
                    let found = analysis.explore_straightline(address);
                    log::info!("Explored straight-line code";
                               "start" => log::Hex(address),
                               "instructions" => found.len());
                }
                analysis.finish(&tree, &|| false)?;

                if let Some(path) = debug_output_graphviz {
                    let mut w = std::io::BufWriter::new(std::fs::File::create(path)?);
                    analysis.types().generate_dot(&mut w)?;
                    w.flush()?;
                }
                output(output_symbols, |w| analysis.write_symbols(w))?;
                output(output_types, |w| analysis.write_memory_types(w))?;
                Ok(())
            };

            if let Err(e) = run() {
                log::crit!("Analysis failed"; "error" => %e);
                drop(_log_guard);
                std::process::exit(1);
            }

            log::trace!("Done");
        }
    }
}
