use std::path::PathBuf;

use doat_core::Result;

pub fn run(dir: PathBuf, host: &str, port: u16) -> Result<()> {
    let base = format!("http://{host}:{port}");

    println!("DOAT results server v{}", doat_core::VERSION);
    println!("   {base}");
    println!("   serving {}", dir.display());
    println!();
    println!("   Endpoints:");
    println!("     GET /                  Summary page");
    println!("     GET /api/results       results.json");
    println!("     GET /api/health        Health check");
    println!("     GET /artifacts/<name>  Raw CSV artifacts (e.g. pcm.csv)");
    println!();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(doat_server::run_server(dir, host, port))?;
    Ok(())
}
