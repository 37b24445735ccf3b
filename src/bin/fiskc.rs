use std::process;

fn main() {
    process::exit(fiskc::client::run())
}
