use chanrpc_cli::run;

fn main() -> anyhow::Result<()> {
    // Channels are single-threaded: everything runs on one thread inside a LocalSet.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    tokio::task::LocalSet::new().block_on(&runtime, run())
}
