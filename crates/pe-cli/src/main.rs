fn main() {
    pe_cli::init_tracing();
    std::process::exit(pe_cli::run_cli_from_args(std::env::args_os()));
}
