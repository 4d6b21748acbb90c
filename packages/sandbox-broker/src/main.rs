fn main() {
    if let Err(err) = sandbox_broker::cli::run_broker() {
        tracing::error!(error = %err, "sandbox-broker failed");
        std::process::exit(1);
    }
}
