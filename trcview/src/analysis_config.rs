//! A global store of flags that tweak how a trace is analyzed.
//!
//! WARNING: Only a single configuration per process is supported; it is fixed the first time
//! [`CONFIG`](static@CONFIG) is touched.

use std::sync::Mutex;

/// The global configuration store. Its fields are expected to be accessed across the program via
/// the global [`CONFIG`](static@CONFIG).
#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    /// Feed every retired step into dynamic type propagation. Without this, only symbols and the
    /// memory trace are recovered.
    pub enable_type_recovery: bool,
    /// Rename subroutines that consist of a single unconditional jump into a named symbol to
    /// `j_<name>` when the analysis finishes.
    pub enable_trampoline_detection: bool,
    /// Compare register state before a call and after its return, to recover which registers a
    /// subroutine preserves.
    pub track_call_register_contracts: bool,
    /// Constrain the source of a register-to-register move even when the move has the native
    /// register width. Off by default: such moves are very often plain copies of whatever happens
    /// to be in the register, and constraining them tends to spread integer evidence onto
    /// pointers.
    pub constrain_same_width_register_moves: bool,
    /// Report subroutines that were discovered but never executed during cleanup
    pub log_unvisited_subroutines: bool,
}

impl AnalysisConfig {
    /// Internal method: picks up the configuration handed to [`Self::initialize`], if any
    fn from_initialized() -> Self {
        INTERNAL_CONFIG_INITIALIZER
            .lock()
            .ok()
            .and_then(|mut init| init.take())
            .unwrap_or_default()
    }

    /// Initialize with the given command line configuration. Should only be called once, and should
    /// only be called from `main`.
    pub fn initialize(command_line_config: Vec<CommandLineAnalysisConfig>) {
        if let Ok(mut init) = INTERNAL_CONFIG_INITIALIZER.lock() {
            let prev = init.replace(command_line_config.into());
            debug_assert!(prev.is_none(), "Performed double initialization");
        }
        lazy_static::initialize(&CONFIG);
    }
}

lazy_static::lazy_static! {
    /// Internal initialization detail.
    static ref INTERNAL_CONFIG_INITIALIZER: Mutex<Option<AnalysisConfig>> = Mutex::new(None);

    /// The global configuration store
    pub static ref CONFIG: AnalysisConfig = AnalysisConfig::from_initialized();
}

#[derive(clap::ArgEnum, Clone, Debug)]
/// Analysis configuration parameters
pub enum CommandLineAnalysisConfig {
    DisableTypeRecovery,
    DisableTrampolineDetection,
    DisableCallRegisterContracts,
    EnableConstrainSameWidthRegisterMoves,
    DisableUnvisitedSubroutineReport,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        AnalysisConfig {
            enable_type_recovery: true,
            enable_trampoline_detection: true,
            track_call_register_contracts: true,
            constrain_same_width_register_moves: false,
            log_unvisited_subroutines: true,
        }
    }
}

impl From<Vec<CommandLineAnalysisConfig>> for AnalysisConfig {
    fn from(v: Vec<CommandLineAnalysisConfig>) -> Self {
        use CommandLineAnalysisConfig::*;
        let mut r = AnalysisConfig::default();
        for v in v {
            match v {
                DisableTypeRecovery => {
                    r.enable_type_recovery = false;
                }
                DisableTrampolineDetection => {
                    r.enable_trampoline_detection = false;
                }
                DisableCallRegisterContracts => {
                    r.track_call_register_contracts = false;
                }
                EnableConstrainSameWidthRegisterMoves => {
                    r.constrain_same_width_register_moves = true;
                }
                DisableUnvisitedSubroutineReport => {
                    r.log_unvisited_subroutines = false;
                }
            }
        }
        r
    }
}
