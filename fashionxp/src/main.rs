fn main() -> anyhow::Result<()> {
    fashionxp_core::run()
}
