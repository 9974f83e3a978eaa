fn main() -> anyhow::Result<()> {
    fleetmaster::fm::main()
}
