use std::borrow::Cow;

use comms::msg::{Command, Msg, Payload};
use tokio::io;

#[tokio::test]
async fn gradient_frames_arrive_intact() -> io::Result<()> {
    let (one, two) = io::duplex(4096);
    let (rx, tx) = io::split(one);
    let (_, mut tx) = comms::channel(rx, tx);
    let (rx_half, tx_half) = io::split(two);
    let (mut rx, _) = comms::channel(rx_half, tx_half);

    let grad = [0.5_f32, -1.25, 3.0];
    tx.send(&Msg::Data(Payload::Gradient(&grad))).await?;
    tx.send(&Msg::Control(Command::Disconnect)).await?;

    let mut rx_buf: Vec<u32> = Vec::new();
    match rx.recv_into(&mut rx_buf).await? {
        Msg::Data(Payload::Gradient(got)) => assert_eq!(got, grad),
        other => panic!("unexpected msg: {other:?}"),
    }

    let msg: Msg = rx.recv_into(&mut rx_buf).await?;
    assert_eq!(msg, Msg::Control(Command::Disconnect));
    Ok(())
}

#[tokio::test]
async fn error_text_is_forwarded() -> io::Result<()> {
    let (one, two) = io::duplex(256);
    let (rx, tx) = io::split(one);
    let (_, mut tx) = comms::channel(rx, tx);
    let (rx_half, tx_half) = io::split(two);
    let (mut rx, _) = comms::channel(rx_half, tx_half);

    tx.send(&Msg::Err(Cow::Borrowed("rank 1 diverged"))).await?;

    let mut rx_buf: Vec<u32> = Vec::new();
    let msg: Msg = rx.recv_into(&mut rx_buf).await?;
    assert_eq!(msg, Msg::Err(Cow::Borrowed("rank 1 diverged")));
    Ok(())
}
