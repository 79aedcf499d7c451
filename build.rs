use std::env;
use std::fs;
use std::path::Path;

fn main() {
    // Create config template if it doesn't exist
    let out_dir = env::var("OUT_DIR").unwrap_or_else(|_| "./".to_string());
    let template_path = Path::new(&out_dir).join("../../../config.template.toml");
    
    let template = r#"# AVB stream handler configuration template
# Copy this file to 'config.toml' and fill in your actual values

tspec.interval.high = "125000"
rx.validation.threshold = "100"
"#;
    
    let _ = fs::write(template_path, template);
    println!("cargo:rerun-if-changed=build.rs");
}
