use clap::Parser;

fn main() -> anyhow::Result<()> {
    let cfg = virtual_fido::config::Config::parse();
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(virtual_fido::run(cfg))
}
