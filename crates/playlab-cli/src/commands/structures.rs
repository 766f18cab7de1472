//! Structures command: inspect the detector registry.

use anyhow::Result;
use colored::Colorize;

use playlab_core::registry::Registry;

pub fn list() -> Result<i32> {
    let registry = Registry::builtin();
    println!("{}", "Registered structure types".bold());
    for type_name in registry.list_types() {
        let info = registry
            .info(&type_name)
            .expect("listed type is registered");
        println!("  {}", type_name.cyan());
        if !info.required_params.is_empty() {
            println!("    required params: {}", info.required_params.join(", "));
        }
        if !info.optional_params.is_empty() {
            println!("    optional params: {}", info.optional_params.join(", "));
        }
        if !info.depends_on.is_empty() {
            println!("    depends on:      {}", info.depends_on.join(", "));
        }
    }
    Ok(0)
}
