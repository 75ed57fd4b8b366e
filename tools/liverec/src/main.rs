fn main() {
    match liverec::run() {
        Ok(code) => std::process::exit(code),
        Err(error) => {
            eprintln!("liverec: {error}");
            std::process::exit(1);
        }
    }
}
