#[tokio::main]
async fn main() {
    lead_qualifier::app::init_tracing();
    lead_qualifier::app::run().await;
}
