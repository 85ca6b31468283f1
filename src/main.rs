#[tokio::main(flavor = "current_thread")]
async fn main() {
    if let Err(error) = chat_composer::run().await {
        eprintln!("chat-composer: {error}");
        std::process::exit(1);
    }
}
