use serde_json::json;
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::env;
use uuid::Uuid;

use runflow::jobs::Job;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        eprintln!(
            "runflowctl <command>\n\
             Commands:\n\
             - reset\n\
             - seed <n>\n\
             - counts\n\
             - show <job_id>\n\
             \n\
             Uses DATABASE_URL or TEST_DATABASE_URL.\n"
        );
        std::process::exit(2);
    }

    let url = env::var("DATABASE_URL")
        .or_else(|_| env::var("TEST_DATABASE_URL"))
        .expect("DATABASE_URL or TEST_DATABASE_URL must be set");

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await?;

    match args[1].as_str() {
        "reset" => reset(&pool).await?,
        "seed" => {
            let n: i64 = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(5);
            seed(&pool, n).await?;
        }
        "counts" => show_counts(&pool).await?,
        "show" => {
            let id = args.get(2).expect("usage: runflowctl show <job_id>");
            let job_id: Uuid = id.parse()?;
            show_job(&pool, job_id).await?;
        }
        other => {
            eprintln!("Unknown command: {other}");
            std::process::exit(2);
        }
    }

    Ok(())
}

async fn reset(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::query("TRUNCATE TABLE jobs RESTART IDENTITY CASCADE")
        .execute(pool)
        .await?;

    println!("reset OK");
    Ok(())
}

async fn seed(pool: &PgPool, n: i64) -> anyhow::Result<()> {
    for i in 0..n {
        let period = format!("2025{:02}", (i % 12) + 1);
        let q = format!("I{}", i + 1);
        let params = json!({ "period": period, "q": q });

        let job_id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO jobs (job_type, period, q, params, status)
            VALUES ('monthly_load', $1, $2, $3, 'queued')
            RETURNING id
            "#,
        )
        .bind(&period)
        .bind(&q)
        .bind(&params)
        .fetch_one(pool)
        .await?;

        println!("+ inserted job period={period} q={q} id={job_id}");
    }
    Ok(())
}

async fn show_counts(pool: &PgPool) -> anyhow::Result<()> {
    let queued: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE status='queued'")
        .fetch_one(pool)
        .await?;
    let running: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE status='running'")
        .fetch_one(pool)
        .await?;
    let failed: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE status='failed'")
        .fetch_one(pool)
        .await?;

    println!("jobs: queued={queued} running={running} failed={failed}");
    Ok(())
}

async fn show_job(pool: &PgPool, job_id: Uuid) -> anyhow::Result<()> {
    let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1")
        .bind(job_id)
        .fetch_optional(pool)
        .await?;

    match job {
        Some(job) => {
            println!(
                "JOB: id={} type={} period={} q={} status={} attempt={}/{}",
                job.id, job.job_type, job.period, job.q, job.status, job.attempt, job.max_attempts
            );
            println!(
                "     created_at={} started_at={:?} finished_at={:?}",
                job.created_at, job.started_at, job.finished_at
            );
            println!("     log_path={:?} error={:?}", job.log_path, job.error);
            println!("     params={}", job.params);
        }
        None => println!("no job with id {job_id}"),
    }

    Ok(())
}
