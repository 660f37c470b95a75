//! Example: the full task/attestation round trip on an in-memory ledger
//!
//! Run with: cargo run --example attest_offline

use avs_core::{
    content_hash, verify, Journal, MemoryLedger, Operator, OperatorConfig, Signer, TaskSubmitter,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("AI AVS - Offline Attestation Walkthrough\n");
    println!("==============================================\n");

    // Step 1: Identities (in production these come from AI_PRIVATE_KEY / OPERATOR_PRIVATE_KEY)
    println!("1. Generating AI and operator keys...");
    let ai = Signer::random();
    let operator = Signer::random();
    println!("   AI identity: {:?}", ai.address());
    println!("   Operator:    {:?}\n", operator.address());

    // Step 2: Ledger with the AI identity published and the operator registered
    println!("2. Preparing in-memory ledger...");
    let ledger = Arc::new(MemoryLedger::new(ai.address()));
    ledger.register_operator(operator.address());
    println!("   Operator registered\n");

    // Step 3: Offline signature check
    println!("3. Signing \"hello\" with the AI key...");
    let hash = content_hash("hello");
    let signature = ai.sign(&hash)?;
    println!("   hash:      0x{}", hex::encode(hash));
    println!("   signature: {}", signature);
    println!("   verifies against AI identity: {}", verify(&hash, signature.as_slice(), ai.address()));
    println!("   verifies against operator:    {}\n", verify(&hash, signature.as_slice(), operator.address()));

    // Step 4: Start the operator service
    println!("4. Starting operator...");
    let shutdown = CancellationToken::new();
    let config = OperatorConfig {
        start_block: Some(0),
        ..OperatorConfig::default()
    };
    let mut service = Operator::new(ledger.clone(), operator.clone(), Journal::in_memory(), config);
    let token = shutdown.clone();
    let running = tokio::spawn(async move {
        let result = service.run(token).await;
        (service, result)
    });

    // Step 5: Submit one genuine task and one signed by an impostor
    println!("5. Submitting tasks...");
    let submitter = TaskSubmitter::new(ledger.clone(), ai);
    let genuine = submitter.submit_task("hello").await?;
    println!("   genuine task  #{:?} in tx {:?}", genuine.task_index, genuine.tx_hash);

    let impostor = TaskSubmitter::new(ledger.clone(), Signer::random());
    let forged = impostor.submit_task("hello").await?;
    println!("   forged task   #{:?} in tx {:?}\n", forged.task_index, forged.tx_hash);

    // Step 6: Wait for both attestations
    println!("6. Waiting for operator responses...");
    while ledger.responses().len() < 2 {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    for record in ledger.responses() {
        println!(
            "   task #{} -> \"{}\" by {:?} (tx {:?})",
            record.task_index, record.response, record.operator, record.tx_hash
        );
    }
    println!();

    // Step 7: Shut down cleanly
    println!("7. Shutting down...");
    shutdown.cancel();
    let (service, result) = running.await?;
    result?;
    for index in 0..2 {
        println!("   journal: task #{} is {:?}", index, service.journal().state(index));
    }

    println!("\n==============================================");
    println!("Attestation workflow complete!");
    Ok(())
}
