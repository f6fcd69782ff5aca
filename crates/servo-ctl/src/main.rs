mod runtime;

fn main() {
    if let Err(e) = runtime::run_from_args() {
        eprintln!("servo-ctl: {e}");
        std::process::exit(1);
    }
}
