use deployflow::jobs::{JobPayload, JobQueue, JobStatus, PgJobQueue};
use deployflow::pipelines::rollback::request_rollback;
use deployflow::store::{PgStore, Store};
use sqlx::postgres::PgPoolOptions;
use std::env;
use uuid::Uuid;

const USAGE: &str = "deployctl <command>\n\
Commands:\n\
 - counts\n\
 - jobs [status] [limit]\n\
 - job <job_id>\n\
 - logs <deployment_id>\n\
 - enqueue <job_type> <payload_json>\n\
 - rollback <deployment_id>\n\
 - reap\n\
\n\
Uses DATABASE_URL or TEST_DATABASE_URL.\n";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    deployflow::telemetry::init_tracing();
    dotenvy::dotenv().ok();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("{USAGE}");
        std::process::exit(2);
    }

    let url = env::var("DATABASE_URL")
        .or_else(|_| env::var("TEST_DATABASE_URL"))
        .map_err(|_| anyhow::anyhow!("DATABASE_URL or TEST_DATABASE_URL must be set"))?;

    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(&url)
        .await?;
    let queue = PgJobQueue::new(pool.clone());
    let store = PgStore::new(pool);

    match args[1].as_str() {
        "counts" => {
            let c = queue.counts().await?;
            println!(
                "jobs: pending={} processing={} completed={} failed={}",
                c.pending, c.processing, c.completed, c.failed
            );
        }
        "jobs" => {
            let status = match args.get(2) {
                Some(s) => Some(
                    JobStatus::parse(s).ok_or_else(|| anyhow::anyhow!("unknown status {s}"))?,
                ),
                None => None,
            };
            let limit = args.get(3).and_then(|s| s.parse().ok()).unwrap_or(50);
            for job in queue.list_jobs(status, limit).await? {
                println!(
                    "{} | {:<18} | {:<10} | {}/{} | run_at={} | {}",
                    job.id,
                    job.job_type,
                    job.status,
                    job.attempts,
                    job.max_attempts,
                    job.run_at,
                    job.last_error.as_deref().unwrap_or("-"),
                );
            }
        }
        "job" => {
            let id = arg_uuid(&args, 2, "job <job_id>")?;
            match queue.get_job(id).await? {
                Some(job) => println!("{}", serde_json::to_string_pretty(&job)?),
                None => println!("job {id} not found"),
            }
        }
        "logs" => {
            let id = arg_uuid(&args, 2, "logs <deployment_id>")?;
            for entry in store.list_logs(id).await? {
                println!(
                    "{} | {:<8} | {:<5} | {}",
                    entry.timestamp.to_rfc3339(),
                    entry.phase.as_str(),
                    entry.level.as_str(),
                    entry.message
                );
            }
        }
        "enqueue" => {
            let job_type = args
                .get(2)
                .ok_or_else(|| anyhow::anyhow!("usage: deployctl enqueue <job_type> <payload_json>"))?;
            let body: serde_json::Value =
                serde_json::from_str(args.get(3).map(String::as_str).unwrap_or("{}"))?;
            // Decode up front so a typo never reaches the queue.
            let payload = JobPayload::decode(job_type, &body)?;
            let job_id = queue.enqueue_payload(payload).await?;
            println!("enqueued {job_type} id={job_id}");
        }
        "rollback" => {
            let target = arg_uuid(&args, 2, "rollback <deployment_id>")?;
            let req = request_rollback(&store, &queue, target).await?;
            println!(
                "rollback deployment={} job={}",
                req.deployment_id, req.job_id
            );
        }
        "reap" => {
            let n = queue.reap_expired_leases().await?;
            println!("reaped {n} expired leases");
        }
        other => {
            eprintln!("Unknown command: {other}\n\n{USAGE}");
            std::process::exit(2);
        }
    }

    Ok(())
}

fn arg_uuid(args: &[String], idx: usize, usage: &str) -> anyhow::Result<Uuid> {
    let raw = args
        .get(idx)
        .ok_or_else(|| anyhow::anyhow!("usage: deployctl {usage}"))?;
    Ok(raw.parse()?)
}
