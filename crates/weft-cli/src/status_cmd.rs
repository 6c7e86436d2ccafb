//! `weft status`: list recent instances or show one, straight from the
//! database.

use anyhow::{Context, Result};
use sqlx::PgPool;

use weft_db::queries::instances as instance_db;

pub async fn run_status(pool: &PgPool, instance_id: Option<i64>) -> Result<()> {
    match instance_id {
        Some(id) => {
            let row = instance_db::get_instance(pool, id)
                .await?
                .with_context(|| format!("no workflow instance {id}"))?;

            println!("instance:  {}", row.workflow_instance_id);
            println!("workflow:  {}", row.workflow_id);
            println!("node:      {}", row.node_name);
            println!("status:    {}", row.workflow_instance_status);
            println!("errors:    {}", row.workflow_instance_errors);
            println!("started:   {}", row.workflow_instance_start);
            match row.workflow_instance_end {
                Some(end) => println!("ended:     {end}"),
                None => println!("ended:     -"),
            }
            if let Some(savepoint) = row.workflow_instance_savepoint {
                println!("\n{savepoint}");
            }
        }
        None => {
            let rows = instance_db::list_instances(pool, 50).await?;
            if rows.is_empty() {
                println!("No workflow instances.");
                return Ok(());
            }
            println!(
                "{:<10} {:<12} {:<12} {:<8} {}",
                "ID", "STATUS", "ERRORS", "WF", "STARTED"
            );
            for row in rows {
                println!(
                    "{:<10} {:<12} {:<12} {:<8} {}",
                    row.workflow_instance_id,
                    row.workflow_instance_status.to_string(),
                    row.workflow_instance_errors,
                    row.workflow_id,
                    row.workflow_instance_start
                );
            }
        }
    }
    Ok(())
}
