//! Integration tests for the handshake over a real TCP socket.

use std::time::Duration;

use huddle_common::Message;
use huddle_crypto::{envelope, HandshakeError, Initiator, KeyMaterial, Responder};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

async fn write_frame(stream: &mut (impl AsyncWriteExt + Unpin), msg: &Message) {
    let mut line = msg.to_frame().unwrap();
    line.push('\n');
    stream.write_all(line.as_bytes()).await.unwrap();
}

async fn read_frame<R: AsyncBufReadExt + Unpin>(reader: &mut R) -> Option<Message> {
    let mut line = String::new();
    let n = timeout(Duration::from_secs(5), reader.read_line(&mut line))
        .await
        .unwrap()
        .unwrap();
    (n > 0).then(|| Message::from_frame(&line).unwrap())
}

/// Student "816012345" completes the handshake and both sides hold equal keys.
#[tokio::test]
async fn test_handshake_over_tcp() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut reader = BufReader::new(read);
        let mut responder = Responder::new("127.0.0.1");

        let intro = read_frame(&mut reader).await.unwrap();
        let challenge = responder
            .challenge_with_nonce(&intro, "a1b2c3d4e5f60718293a4b5c6d7e8f90".to_string())
            .unwrap();
        write_frame(&mut write, &challenge).await;

        let response = read_frame(&mut reader).await.unwrap();
        let keys = responder.verify(&response).unwrap();
        write_frame(
            &mut write,
            &envelope::seal(&Message::control("127.0.0.1"), &keys).unwrap(),
        )
        .await;

        // First application message from the member.
        let sealed = read_frame(&mut reader).await.unwrap();
        let msg = envelope::open(&sealed, &keys).unwrap();
        (keys, msg)
    });

    let stream = TcpStream::connect(addr).await.unwrap();
    let local = stream.local_addr().unwrap().ip().to_string();
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);
    let mut initiator = Initiator::new("816012345", &local);

    write_frame(&mut write, &initiator.start().unwrap()).await;
    let challenge = read_frame(&mut reader).await.unwrap();
    let response = initiator.answer_challenge(&challenge).unwrap();
    write_frame(&mut write, &response).await;

    let ack = read_frame(&mut reader).await.unwrap();
    let keys = initiator.confirm(&ack).unwrap();

    let hello = Message::new("hello", local.clone());
    write_frame(&mut write, &envelope::seal(&hello, &keys).unwrap()).await;

    let (server_keys, received) = server.await.unwrap();
    assert_eq!(server_keys, keys);
    assert_eq!(server_keys, KeyMaterial::derive("816012345"));
    assert_eq!(received.text(), "hello");
    assert_eq!(received.sender_address(), local);
}

/// A member encrypting under the wrong identifier is refused and the socket closed.
#[tokio::test]
async fn test_wrong_identifier_closes_socket() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut reader = BufReader::new(read);
        let mut responder = Responder::new("127.0.0.1");

        let intro = read_frame(&mut reader).await.unwrap();
        write_frame(&mut write, &responder.challenge(&intro).unwrap()).await;
        let response = read_frame(&mut reader).await.unwrap();
        let result = responder.verify(&response);
        // Dropping both halves closes the socket.
        result.map(|_| ())
    });

    let stream = TcpStream::connect(addr).await.unwrap();
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);

    write_frame(&mut write, &Message::introduction("127.0.0.1", "816012345")).await;
    let challenge = read_frame(&mut reader).await.unwrap();
    let forged = KeyMaterial::derive("816099999")
        .encrypt(challenge.text())
        .unwrap();
    write_frame(
        &mut write,
        &Message::with_identifier(forged, "127.0.0.1", "816012345"),
    )
    .await;

    let result = server.await.unwrap();
    assert!(matches!(result, Err(HandshakeError::Mismatch)));

    // No acknowledgement arrives: the stream ends.
    assert!(read_frame(&mut reader).await.is_none());
}
