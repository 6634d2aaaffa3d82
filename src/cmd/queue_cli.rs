use structopt::StructOpt;

use crate::{
    database::RedisPool,
    error::Error,
    queues::{Job, JobOptions, Queue, QueueSettings},
};

#[derive(Debug, StructOpt)]
pub struct Args {
    queue: String,
    #[structopt(subcommand)]
    cmd: QueueCmd,
}

#[derive(Debug, StructOpt)]
enum QueueCmd {
    #[structopt(about = "Enqueue a job with a JSON payload")]
    Add {
        data: String,
        #[structopt(long, help = "Delay before the job runs, in milliseconds")]
        delay: Option<u64>,
        #[structopt(long, help = "Maximum number of attempts")]
        attempts: Option<u32>,
    },
    #[structopt(about = "Show the ids in each bucket")]
    Show,
    #[structopt(name = "show-job", about = "Show one job record")]
    ShowJob { id: String },
    #[structopt(about = "Show the queue counters")]
    Stats,
    #[structopt(about = "Remove a job wherever it is")]
    Del { id: String },
    #[structopt(about = "Delete every key the queue owns")]
    Clean,
}

pub async fn main(args: Args) -> Result<(), Error> {
    let pool = RedisPool::from_env()?;
    let queue = Queue::new(pool, &args.queue, QueueSettings::default());

    match args.cmd {
        QueueCmd::Add {
            data,
            delay,
            attempts,
        } => {
            let data: serde_json::Value = serde_json::from_str(&data)?;
            let mut options = JobOptions::default();
            if let Some(delay_ms) = delay {
                options.delay_ms = delay_ms;
            }
            if let Some(max_attempts) = attempts {
                options.max_attempts = max_attempts;
            }

            let job = Job::new(queue.name(), data, options, None);
            queue.add(&job).await?;
            println!("{}", job.id);
        }
        QueueCmd::Show => {
            println!("waiting:   {:?}", queue.list_waiting().await?);
            println!("active:    {:?}", queue.list_active().await?);
            println!("completed: {:?}", queue.list_completed().await?);
            println!("failed:    {:?}", queue.list_failed().await?);
            println!("delayed:");
            for (id, run_at) in queue.list_delayed().await? {
                println!("  {} at {}", id, run_at.to_rfc3339());
            }
        }
        QueueCmd::ShowJob { id } => match queue.get(&id).await? {
            Some(job) => println!("{}", serde_json::to_string_pretty(&job)?),
            None => println!("No job {}", id),
        },
        QueueCmd::Stats => {
            let stats = queue.stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        QueueCmd::Del { id } => {
            let removed = queue.remove(&id).await?;
            println!("{}", if removed { "removed" } else { "not found" });
        }
        QueueCmd::Clean => {
            queue.clean().await?;
            println!("cleaned");
        }
    }

    Ok(())
}
