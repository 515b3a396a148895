#[tokio::main]
async fn main() {
    if let Err(e) = chestcare_lib::run().await {
        eprintln!("chestcare: {e}");
        std::process::exit(1);
    }
}
