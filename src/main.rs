fn main() {
    if let Err(e) = autojoin_lib::run() {
        eprintln!("autojoin: {}", e);
        std::process::exit(1);
    }
}
