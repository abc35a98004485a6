use anyhow::{Context, Result};
use aws_config::BehaviorVersion;
use dispatch::config::required_env;
use dispatch::recipients::RecipientValidator;
use dispatch::storage::DynamoStorage;
use std::env;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: cargo run --bin validate-recipients <file>");
        eprintln!(
            "Example: DYNAMODB_TABLE=Newsletter-staging cargo run --bin validate-recipients list.txt"
        );
        std::process::exit(1);
    }

    let path = &args[1];
    let raw = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path))?;

    let dynamodb_table = required_env("DYNAMODB_TABLE")?;

    println!("Initializing DynamoDB client...");
    let config = aws_config::load_defaults(BehaviorVersion::latest()).await;
    let dynamodb_client = aws_sdk_dynamodb::Client::new(&config);
    let storage = Arc::new(DynamoStorage::new(dynamodb_client, dynamodb_table));
    let validator = RecipientValidator::new(storage);

    println!("Validating recipients from {}", path);
    let report = validator.validate_and_hash(&raw).await?;

    println!("Validation complete:");
    println!("  Valid (unique): {}", report.valid);
    println!("  Invalid:        {}", report.invalid);
    println!("  Duplicates:     {}", report.duplicates);
    println!("  New:            {}", report.new);
    println!("  Existing:       {}", report.existing);
    for line in &report.invalid_emails {
        println!("  ! {}", line);
    }

    Ok(())
}
