use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use inventory_sync::config;
use inventory_sync::inventory::model::{dropdown_str, external_id};
use inventory_sync::inventory::{ComponentType, InventoryClient, InventorySource};
use inventory_sync::sync::PAGE_SIZE;

#[derive(Parser, Debug)]
#[command(about = "Check connectivity to the inventory API and print what it returns")]
struct Args {
    /// Path to YAML config
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Show the components of one asset instead of the first catalog page
    #[arg(long)]
    asset_id: Option<i64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    let client = InventoryClient::from_config(&cfg)?;

    client.open_session().await?;
    let outcome = match args.asset_id {
        Some(asset_id) => print_components(&client, asset_id).await,
        None => print_first_page(&client).await,
    };
    client.close_session().await;
    outcome
}

async fn print_first_page(client: &InventoryClient) -> Result<()> {
    let page = client.fetch_assets_page(0, PAGE_SIZE).await?;
    println!("First page: {} records", page.len());
    for record in &page {
        let id = external_id(record)
            .map(|id| id.to_string())
            .unwrap_or_else(|| "?".to_string());
        println!(
            "  {} -> {{ name: {}, location: {}, status: {} }}",
            id,
            dropdown_str(record, "name"),
            dropdown_str(record, "locations_id"),
            dropdown_str(record, "states_id"),
        );
    }
    Ok(())
}

async fn print_components(client: &InventoryClient, asset_id: i64) -> Result<()> {
    println!("Components of asset {}:", asset_id);
    for component_type in ComponentType::ALL {
        match client.fetch_components(asset_id, component_type).await {
            Ok(items) => {
                println!("  {}: {}", component_type, items.len());
                for item in &items {
                    println!("    - {}", component_type.component_name(item));
                }
            }
            Err(err) => println!("  {}: error: {}", component_type, err),
        }
    }
    Ok(())
}
