//! Full-broker flow: admission, topic registration, and update fan-out
//! between two nodes.

use std::sync::Arc;
use std::time::Duration;

use meridian_core::protocol::{
    Credential, Message, RecvStatus, RegistrationOp, TopicKind, TopicRegistration, TopicUpdate,
    Transport, UpdateOp,
};
use meridian_masterd::{Master, MasterConfig};
use meridian_masterd::config::AdmissionConfig;
use tokio::net::UnixStream;

const READ_TIMEOUT: Duration = Duration::from_millis(50);
const SECRET: &[u8] = b"s3cret";

fn fast_config(socket_path: std::path::PathBuf) -> MasterConfig {
    MasterConfig {
        socket_path,
        secret: String::from_utf8(SECRET.to_vec()).unwrap(),
        read_timeout: READ_TIMEOUT,
        admission: AdmissionConfig {
            cutoff: 1,
            iterator_budget: Duration::from_millis(50),
            grace_period: Duration::from_secs(10),
            max_workers: 3,
            overseer_period: Duration::from_millis(50),
        },
    }
}

/// Poll `probe` until it returns true or a generous deadline passes.
async fn eventually<F, Fut>(what: &str, mut probe: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if probe().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Connect to the broker and authenticate.
async fn join(master: &Master) -> Transport<UnixStream> {
    let stream = UnixStream::connect(&master.config().socket_path)
        .await
        .unwrap();
    let mut transport = Transport::new(stream, READ_TIMEOUT).unwrap();
    transport
        .send(&Message::auth(Credential::Password(SECRET.to_vec())))
        .await
        .unwrap();
    transport
}

/// Receive frames until one decodes to a `TOPIC_UPD`, within a deadline.
async fn next_update(transport: &mut Transport<UnixStream>) -> TopicUpdate {
    for _ in 0..100 {
        match transport.recv_for(Duration::from_millis(100)).await.unwrap() {
            RecvStatus::Ready(frame) => match Message::decode(&frame).unwrap() {
                Message::TopicUpd(update) => return update,
                other => panic!("unexpected message from broker: {other:?}"),
            },
            RecvStatus::Pending => {}
        }
    }
    panic!("no topic update arrived");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn publishers_and_subscribers_discover_each_other() {
    let dir = tempfile::tempdir().unwrap();
    let master = Arc::new(Master::new(fast_config(dir.path().join("master.sock"))));

    let runner = {
        let master = Arc::clone(&master);
        tokio::spawn(async move { master.run().await })
    };
    let socket_path = master.config().socket_path.clone();
    eventually("the broker socket", || {
        let path = socket_path.clone();
        async move { path.exists() }
    })
    .await;

    // A publisher joins and registers.
    let mut publisher = join(&master).await;
    publisher
        .send(&Message::TopicReg(TopicRegistration {
            op: RegistrationOp::Insert,
            kind: TopicKind::Publish,
            name: b"/sensors/imu".to_vec(),
            registrar: b"imu0".to_vec(),
        }))
        .await
        .unwrap();
    eventually("the publisher registration", || {
        let master = Arc::clone(&master);
        async move { master.topic_census("/sensors/imu").await == Some((1, 0)) }
    })
    .await;

    // A subscriber joins, registers, and is told about the publisher.
    let mut subscriber = join(&master).await;
    subscriber
        .send(&Message::TopicReg(TopicRegistration {
            op: RegistrationOp::Insert,
            kind: TopicKind::Subscribe,
            name: b"/sensors/imu".to_vec(),
            registrar: b"nav".to_vec(),
        }))
        .await
        .unwrap();

    let update = next_update(&mut subscriber).await;
    assert_eq!(update.op, UpdateOp::Add);
    assert_eq!(update.registrar, b"imu0".to_vec());
    assert!(!update.addr.is_empty());
    assert_eq!(master.topic_census("/sensors/imu").await, Some((1, 1)));

    // The publisher announces shutdown; the subscriber hears it left.
    publisher.send(&Message::shutdown(0)).await.unwrap();
    let update = next_update(&mut subscriber).await;
    assert_eq!(update.op, UpdateOp::Remove);
    assert_eq!(update.registrar, b"imu0".to_vec());
    eventually("the publisher to be swept", || {
        let master = Arc::clone(&master);
        async move { master.topic_census("/sensors/imu").await == Some((0, 1)) }
    })
    .await;

    master.shutdown();
    runner.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unauthenticated_connections_never_reach_the_registry() {
    let dir = tempfile::tempdir().unwrap();
    let master = Arc::new(Master::new(fast_config(dir.path().join("master.sock"))));

    let runner = {
        let master = Arc::clone(&master);
        tokio::spawn(async move { master.run().await })
    };
    let socket_path = master.config().socket_path.clone();
    eventually("the broker socket", || {
        let path = socket_path.clone();
        async move { path.exists() }
    })
    .await;

    // Wrong secret: the connection is dropped, nothing is serviced.
    let stream = UnixStream::connect(&socket_path).await.unwrap();
    let mut impostor = Transport::new(stream, READ_TIMEOUT).unwrap();
    impostor
        .send(&Message::auth(Credential::Password(b"wrong".to_vec())))
        .await
        .unwrap();

    // A legitimate node joining afterwards is serviced as usual.
    let mut member = join(&master).await;
    member
        .send(&Message::TopicReg(TopicRegistration {
            op: RegistrationOp::Insert,
            kind: TopicKind::Publish,
            name: b"/t".to_vec(),
            registrar: b"p".to_vec(),
        }))
        .await
        .unwrap();
    eventually("the member registration", || {
        let master = Arc::clone(&master);
        async move { master.topic_census("/t").await == Some((1, 0)) }
    })
    .await;
    assert_eq!(master.serviced_nodes().await, 1);

    master.shutdown();
    runner.await.unwrap().unwrap();
}
