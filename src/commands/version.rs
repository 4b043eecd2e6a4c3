pub fn run() -> anyhow::Result<()> {
    println!("kube-mender {}", env!("CARGO_PKG_VERSION"));
    Ok(())
}
