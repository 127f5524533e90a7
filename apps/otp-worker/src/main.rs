//! OTP Worker Service - Entry Point
//!
//! Background worker that delivers OTP emails from the notification queue.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    otp_worker::run().await
}
