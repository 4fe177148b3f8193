use std::error::Error;
use std::io::Write;

use genstream_sdk::auth::EnvToken;
use genstream_sdk::stream::client::StreamClient;
use genstream_sdk::stream::proto::{GenerationRequest, GenerationResponse};
use genstream_sdk::stream::session::{SessionEvent, SessionState};
use tokio::sync::mpsc;

fn main() -> Result<(), Box<dyn Error>> {
    let base_url = "http://localhost:8000";
    let prompt = "a lighthouse at dusk, oil painting";

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        // Reads HF_TOKEN.
        let client = StreamClient::for_base_url(base_url, EnvToken::default())?;
        let request = GenerationRequest::new(prompt)
            .with_negative_prompt("blurry, low quality")
            .with_size(1024, 768)
            .with_steps(30)
            .with_seed(42);

        let (events_tx, mut events) = mpsc::unbounded_channel();
        let handle = client.start(request, events_tx)?;
        println!("session {} connecting to {}", handle.id(), client.endpoint());

        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::Started => println!("generation started"),
                SessionEvent::Progress { progress, step } => {
                    print!("\rstep {step:>3} {:>5.1}%", progress * 100.0);
                    std::io::stdout().flush()?;
                }
                SessionEvent::Result { data } => {
                    println!();
                    match GenerationResponse::from_result_data(&data) {
                        Ok(response) => println!(
                            "done in {:.2}s seed={} model={} image_b64_len={}",
                            response.generation_time,
                            response.seed,
                            response.model_id,
                            response.image_b64.len()
                        ),
                        Err(_) => println!("result: {data}"),
                    }
                    break;
                }
                SessionEvent::Error { error } => {
                    println!();
                    eprintln!("generation failed: {error}");
                    break;
                }
            }
        }

        let state = handle.wait().await;
        if state != SessionState::Closed {
            eprintln!("session ended in state {state:?}");
        }
        Ok::<(), Box<dyn Error>>(())
    })?;

    Ok(())
}
