fn main() -> std::io::Result<()> {
    let config = rs_serve::config::init();
    rs_serve::server::main(config)
}
