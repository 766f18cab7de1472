//! Compare command: hash-equality check between two run directories.

use std::path::Path;

use anyhow::Result;
use colored::Colorize;

use playlab_engine::determinism::compare_runs;

use super::exit_code_for;

pub fn execute(run_a: &str, run_b: &str) -> Result<i32> {
    let result = match compare_runs(Path::new(run_a), Path::new(run_b)) {
        Ok(result) => result,
        Err(e) => {
            eprintln!("{} {}", "error:".red(), e);
            return Ok(exit_code_for(e.code()));
        }
    };

    print!("{}", result.report());
    if result.passed {
        println!("{}", "determinism: PASSED".green().bold());
        Ok(0)
    } else {
        println!("{}", "determinism: FAILED".red().bold());
        Ok(exit_code_for("INVARIANT_VIOLATION"))
    }
}
