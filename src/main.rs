use structopt::StructOpt;

use queue_service::{cmd, error::Error};

#[derive(StructOpt)]
enum Args {
    #[structopt(about = "Run the queue service engine")]
    Server(cmd::server::Args),
    #[structopt(about = "Examine or administer a queue")]
    Queue(cmd::queue_cli::Args),
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    dotenv::dotenv().ok();

    let args = Args::from_args();

    match args {
        Args::Server(args) => cmd::server::main(args).await,
        Args::Queue(args) => cmd::queue_cli::main(args).await,
    }
}
