fn main() -> anyhow::Result<()> {
    vdrive_cli::run()
}
