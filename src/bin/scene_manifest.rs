use scene_sync::network::schema;
use std::env;
use std::path::PathBuf;

fn main() {
    if let Err(err) = run() {
        eprintln!("[manifest] error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let output_path = env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("schemas/scene_manifest.json"));

    if let Some(label) = schema::find_hash_collision() {
        return Err(format!("stable hash collision on '{label}'").into());
    }
    schema::write_manifest_json(&output_path)?;
    println!(
        "[manifest] wrote {} entity types to {}",
        schema::catalog().len(),
        output_path.display()
    );
    Ok(())
}
