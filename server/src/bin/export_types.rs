// Binary to export TypeScript types
// Run with: cargo run --bin export_types

use ts_rs::TS;

fn main() {
    println!("Exporting TypeScript types...");

    let results = [
        orchestrator::ProgressEvent::export(),
        orchestrator::JobState::export(),
        orchestrator::CancelReason::export(),
        orchestrator::CompletedArtifact::export(),
        orchestrator::JobSnapshot::export(),
        audiograb_server::ErrorResponse::export(),
        audiograb_server::routes::CancelResponse::export(),
        audiograb_server::routes::StreamEnd::export(),
        audiograb_server::routes::QueueRequest::export(),
        audiograb_server::routes::QueueStatus::export(),
        audiograb_server::routes::HealthResponse::export(),
    ];

    for result in results {
        if let Err(e) = result {
            eprintln!("Failed to export type: {}", e);
            std::process::exit(1);
        }
    }

    println!("✓ TypeScript types exported successfully to bindings/");
}
