//! CLI subcommand implementations.

pub mod compare;
pub mod run;
pub mod structures;

/// Map engine error codes 1-to-1 to process exit codes.
pub fn exit_code_for(code: &str) -> i32 {
    match code {
        "VALIDATION_FAILED" => 2,
        "REGISTRY_UNKNOWN_TYPE" => 3,
        "DATA_NOT_AVAILABLE" => 4,
        "INVARIANT_VIOLATION" => 5,
        "INSUFFICIENT_ENTRY_GATE" => 6,
        "STRATEGY_STARVED" => 7,
        "ENTRIES_DISABLED" => 8,
        _ => 1,
    }
}
