// Budgetly CLI - database initialization and status reporting

use anyhow::Result;
use rusqlite::Connection;
use std::env;

use budgetly::{
    count_uploads_by_status, list_upload_records, seed_default_categories, setup_database, Config,
};

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    match args.get(1).map(String::as_str) {
        Some("init") => run_init(),
        Some("status") => run_status(),
        _ => {
            eprintln!("Budgetly v{}", budgetly::VERSION);
            eprintln!();
            eprintln!("Usage:");
            eprintln!("  budgetly init     Create the database and seed categories");
            eprintln!("  budgetly status   Show upload counts per status");
            eprintln!();
            eprintln!("  budgetly-server   Run the HTTP API server");
            std::process::exit(2);
        }
    }
}

fn run_init() -> Result<()> {
    let config = Config::from_env();

    println!("🗄️  Budgetly - Database Init");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::create_dir_all(&config.storage_root)?;
    println!("✓ Storage root: {:?}", config.storage_root);

    let conn = Connection::open(&config.db_path)?;
    setup_database(&conn)?;
    println!("✓ Database initialized with WAL mode: {:?}", config.db_path);

    let seeded = seed_default_categories(&conn)?;
    println!("✓ Seeded {} categories", seeded);

    println!("\n✅ Ready. Start the server with: cargo run --bin budgetly-server");
    Ok(())
}

fn run_status() -> Result<()> {
    let config = Config::from_env();

    if !config.db_path.exists() {
        eprintln!("❌ Database not found at {:?}", config.db_path);
        eprintln!("   Run: budgetly init");
        std::process::exit(1);
    }

    let conn = Connection::open(&config.db_path)?;

    println!("📊 Budgetly - Upload Status");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let counts = count_uploads_by_status(&conn)?;
    if counts.is_empty() {
        println!("No uploads yet.");
        return Ok(());
    }

    for (status, count) in &counts {
        println!("{:>12}: {}", status.to_string(), count);
    }

    let records = list_upload_records(&conn)?;
    println!("\nMost recent:");
    for record in records.iter().take(5) {
        println!(
            "  {}  {:10}  {}",
            record.created_at.format("%Y-%m-%d %H:%M"),
            record.status.to_string(),
            record.original_filename
        );
    }

    Ok(())
}
