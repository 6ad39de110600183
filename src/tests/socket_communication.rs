#[cfg(test)]
mod tests {
    use crate::error::SupervisorError;
    use crate::ipc::IpcMessage;
    use crate::socket_communication::{receive_message, send_message, MAX_FRAME_LEN};

    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixStream;

    async fn setup_mock_unix_stream() -> (UnixStream, UnixStream) {
        UnixStream::pair().expect("Failed to create UnixStream pair")
    }

    #[tokio::test]
    async fn test_send_message() {
        let (mut stream, mut mock_stream) = setup_mock_unix_stream().await;
        let message = IpcMessage::request(7, 42, "metrics.increment", json!({"name": "requests"}));

        send_message(&mut stream, &message)
            .await
            .expect("Failed to send message");

        let mut length_bytes = [0u8; 4];
        mock_stream
            .read_exact(&mut length_bytes)
            .await
            .expect("Failed to read length");
        let length = u32::from_be_bytes(length_bytes) as usize;

        let mut message_bytes = vec![0u8; length];
        mock_stream
            .read_exact(&mut message_bytes)
            .await
            .expect("Failed to read message");

        let raw: serde_json::Value =
            serde_json::from_slice(&message_bytes).expect("Failed to deserialize message");
        assert_eq!(raw["id"], 7);
        assert_eq!(raw["reqPid"], 42);
        assert_eq!(raw["type"], "request");
        assert!(raw.get("resPid").is_none());
    }

    #[tokio::test]
    async fn test_receive_message() {
        let (mut stream, mut mock_stream) = setup_mock_unix_stream().await;

        let request = IpcMessage::request(3, 10, "statistics.crashes", json!({}));
        let response = request.clone().into_response(1, None, Some(json!([])));
        send_message(&mut mock_stream, &response)
            .await
            .expect("Failed to send message");

        let received: IpcMessage = receive_message(&mut stream)
            .await
            .expect("Failed to receive message")
            .expect("Stream closed early");

        assert!(received.is_response());
        assert_eq!(received.id, 3);
        assert_eq!(received.req_pid, 10);
        assert_eq!(received.res_pid, Some(1));
        assert_eq!(received.result, Some(json!([])));
    }

    #[tokio::test]
    async fn test_receive_on_closed_stream() {
        let (mut stream, mock_stream) = setup_mock_unix_stream().await;
        drop(mock_stream);

        let received: Option<IpcMessage> = receive_message(&mut stream)
            .await
            .expect("EOF between frames is not an error");
        assert!(received.is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_skipped() {
        let (mut stream, mut mock_stream) = setup_mock_unix_stream().await;

        let writer = tokio::spawn(async move {
            let length = MAX_FRAME_LEN + 1;
            mock_stream
                .write_all(&(length as u32).to_be_bytes())
                .await
                .unwrap();
            mock_stream.write_all(&vec![b'x'; length]).await.unwrap();
            let next = IpcMessage::request(2, 10, "logger.log", json!({}));
            send_message(&mut mock_stream, &next).await.unwrap();
            mock_stream
        });

        let result = receive_message::<_, IpcMessage>(&mut stream).await;
        assert!(matches!(result, Err(SupervisorError::FrameTooLarge(len)) if len == MAX_FRAME_LEN + 1));

        // The stream is still aligned on the following frame.
        let next: IpcMessage = receive_message(&mut stream)
            .await
            .expect("Failed to receive message")
            .expect("Stream closed early");
        assert_eq!(next.id, 2);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_send_writes_nothing() {
        let (mut stream, mut mock_stream) = setup_mock_unix_stream().await;

        let blob = "x".repeat(MAX_FRAME_LEN + 1);
        let big = IpcMessage::request(1, 10, "logger.log", json!({ "blob": blob }));
        let result = send_message(&mut stream, &big).await;
        assert!(matches!(result, Err(ref err) if err.is_frame_error()));

        let small = IpcMessage::request(2, 10, "logger.log", json!({}));
        send_message(&mut stream, &small).await.unwrap();
        let received: IpcMessage = receive_message(&mut mock_stream).await.unwrap().unwrap();
        assert_eq!(received.id, 2);
    }
}
