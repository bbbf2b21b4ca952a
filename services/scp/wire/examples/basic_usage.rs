//! Basic usage example for the SCP wire protocol.

use bytes::BytesMut;
use scp_wire::{Frame, FrameDecoder, Mode, Parameters, Rfi, Signal, Tags, CID, HEARTBEAT};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== SCP Wire Protocol Example ===\n");

    // 1. Build the frames of one exchange
    println!("1. Encoding an exchange...");
    let rfi = Rfi::new(Mode::Reply, "Billing.charge")
        .with_parameters(Parameters::new().with(CID, "example-client"));
    let frames = vec![
        Frame::rfi(&rfi)?,
        Frame::data("[42, \"EUR\"]")?,
        Frame::signal(&Signal::new("progress").with_tags(Tags::new().with("pct", "50")))?,
        Frame::end(),
    ];

    let mut wire = BytesMut::new();
    for frame in &frames {
        frame.encode_into(&mut wire);
    }
    wire.extend_from_slice(&HEARTBEAT);
    println!("   RFI text: {}", rfi);
    println!("   Encoded {} frames into {} bytes", frames.len(), wire.len());

    // 2. Decode them back, one byte at a time
    println!("\n2. Decoding byte by byte...");
    let mut decoder = FrameDecoder::new();
    let mut buf = BytesMut::new();
    for byte in wire.iter() {
        buf.extend_from_slice(&[*byte]);
        while let Some(frame) = decoder.decode(&mut buf)? {
            println!("   {:?} ({} payload bytes)", frame.typ(), frame.payload().len());
        }
    }
    println!("   heartbeats skipped: {}", decoder.heartbeats());

    println!("\n=== Example completed successfully! ===");
    Ok(())
}
