use log::{info, LevelFilter};
use simple_logger::SimpleLogger;

use redic::{cmd, pipeline, RedisClient};

#[tokio::main(worker_threads = 4)]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let logger = SimpleLogger::new().with_level(LevelFilter::Info);
    logger.init()?;

    let client = RedisClient::new();
    client.connect("127.0.0.1", 6379, "", 0, 2000).await?;
    info!("connected to 127.0.0.1:6379");

    let pong = client.query(cmd("PING")).await?;
    info!("PING -> {}", pong);

    let set = client.query(cmd("SET").key("redic:demo").arg("41")).await?;
    info!("SET redic:demo -> {}", set);

    let replies = client
        .query(pipeline().incr("redic:demo").get("redic:demo"))
        .await?;
    info!("INCR+GET pipeline -> {}", replies);

    client.run(cmd("DEL").key("redic:demo"));
    client.close().await;
    Ok(())
}
