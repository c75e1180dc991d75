use std::process::ExitCode;

fn main() -> ExitCode {
    pybridge::run()
}
