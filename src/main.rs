fn main() {
    if let Err(e) = pinbridge_lib::run() {
        eprintln!("pinbridge: {}", e);
        std::process::exit(1);
    }
}
