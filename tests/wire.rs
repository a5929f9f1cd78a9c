use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Config, NoTls, SimpleQueryMessage};
use ulid::Ulid;

use roomcal::engine::{Engine, OperatingWindow};
use roomcal::notify::NotifyHub;
use roomcal::store::Store;
use roomcal::wire::{self, Backend};

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<Backend>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("roomcal_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let store = Arc::new(Store::open(&dir.join("roomcal.wal")).unwrap());
    let hub = Arc::new(NotifyHub::new());
    let engine = Arc::new(Engine::new(
        store.clone(),
        store.clone(),
        hub.clone(),
        OperatingWindow::default(),
    ));
    let backend = Arc::new(Backend { engine, store, hub });

    let served = backend.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let backend = served.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, backend, "roomcal".to_string()).await;
            });
        }
    });

    (addr, backend)
}

async fn connect(addr: SocketAddr) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("roomcal")
        .user("roomcal")
        .password("roomcal");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

/// Data rows of a simple query, each as its text columns.
async fn rows(client: &tokio_postgres::Client, sql: &str) -> Vec<Vec<Option<String>>> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|msg| match msg {
            SimpleQueryMessage::Row(row) => {
                Some((0..row.len()).map(|i| row.get(i).map(str::to_string)).collect())
            }
            _ => None,
        })
        .collect()
}

fn sqlstate(err: &tokio_postgres::Error) -> String {
    err.as_db_error()
        .map(|db| db.code().code().to_string())
        .unwrap_or_default()
}

async fn seed(client: &tokio_postgres::Client) -> (Ulid, Ulid, Ulid, Ulid) {
    let room = Ulid::new();
    let class = Ulid::new();
    let instructor = Ulid::new();
    let student = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO rooms (id, name, type) VALUES ('{room}', 'Lab 1', 'lab');
             INSERT INTO classes (id, name) VALUES ('{class}', '3B');
             INSERT INTO users (id, name, class_id) VALUES ('{instructor}', 'Marta', NULL);
             INSERT INTO users (id, name, class_id) VALUES ('{student}', 'Ana', '{class}');"
        ))
        .await
        .unwrap();
    (room, class, instructor, student)
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn rooms_can_be_created_listed_and_renamed() {
    let (addr, _backend) = start_test_server().await;
    let client = connect(addr).await;
    let (room, ..) = seed(&client).await;

    client
        .batch_execute(&format!(
            "INSERT INTO rooms (id, name, type) VALUES ('{room}', 'Chemistry Lab', 'lab') \
             ON CONFLICT (id) DO UPDATE SET name = excluded.name, type = excluded.type"
        ))
        .await
        .unwrap();

    let listed = rows(&client, "SELECT * FROM rooms").await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0][0].as_deref(), Some(room.to_string().as_str()));
    assert_eq!(listed[0][1].as_deref(), Some("Chemistry Lab"));

    let dup = client
        .batch_execute(&format!("INSERT INTO rooms (id, name, type) VALUES ('{room}', 'X', 'lab')"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&dup), "23505");
}

#[tokio::test]
async fn overlapping_booking_is_rejected_with_exclusion_code() {
    let (addr, _backend) = start_test_server().await;
    let client = connect(addr).await;
    let (room, _, instructor, _) = seed(&client).await;

    client
        .batch_execute(&format!(
            r#"INSERT INTO bookings (room_id, user_id, title, start, "end")
               VALUES ('{room}', '{instructor}', 'Algebra', '2030-03-11 10:00', '2030-03-11 12:00')"#
        ))
        .await
        .unwrap();

    let err = client
        .batch_execute(&format!(
            r#"INSERT INTO bookings (room_id, user_id, title, start, "end")
               VALUES ('{room}', '{instructor}', 'Physics', '2030-03-11 11:00', '2030-03-11 13:00')"#
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "23P01");
    assert!(err.as_db_error().unwrap().message().contains("Algebra"));

    // Touching at the boundary is fine.
    client
        .batch_execute(&format!(
            r#"INSERT INTO bookings (room_id, user_id, title, start, "end")
               VALUES ('{room}', '{instructor}', 'Physics', '2030-03-11 12:00', '2030-03-11 13:00')"#
        ))
        .await
        .unwrap();

    let booked = rows(&client, &format!("SELECT * FROM bookings WHERE room_id = '{room}'")).await;
    assert_eq!(booked.len(), 2);
    assert_eq!(booked[0][5].as_deref(), Some("2030-03-11T10:00:00"));
}

#[tokio::test]
async fn invalid_requests_map_to_sqlstates() {
    let (addr, _backend) = start_test_server().await;
    let client = connect(addr).await;
    let (room, _, instructor, _) = seed(&client).await;

    let insert = |start: &str, end: &str| {
        format!(
            r#"INSERT INTO bookings (room_id, user_id, start, "end")
               VALUES ('{room}', '{instructor}', '{start}', '{end}')"#
        )
    };

    let inverted = client.batch_execute(&insert("2030-03-11 12:00", "2030-03-11 10:00")).await.unwrap_err();
    assert_eq!(sqlstate(&inverted), "22007");

    let late = client.batch_execute(&insert("2030-03-11 20:00", "2030-03-11 22:00")).await.unwrap_err();
    assert_eq!(sqlstate(&late), "23514");

    let missing = client.batch_execute(&format!("DELETE FROM bookings WHERE id = '{}'", Ulid::new())).await.unwrap_err();
    assert_eq!(sqlstate(&missing), "02000");

    let garbage = client.batch_execute("SELEC nothing").await.unwrap_err();
    assert_eq!(sqlstate(&garbage), "42601");
}

#[tokio::test]
async fn occupancy_and_slot_options() {
    let (addr, _backend) = start_test_server().await;
    let client = connect(addr).await;
    let (room, _, instructor, _) = seed(&client).await;

    client
        .batch_execute(&format!(
            r#"INSERT INTO bookings (room_id, user_id, start, "end")
               VALUES ('{room}', '{instructor}', '2030-03-11 10:00', '2030-03-11 12:00')"#
        ))
        .await
        .unwrap();

    let hours: Vec<String> = rows(
        &client,
        &format!("SELECT * FROM occupancy WHERE room_id = '{room}' AND date = '2030-03-11'"),
    )
    .await
    .into_iter()
    .map(|r| r[2].clone().unwrap())
    .collect();
    assert_eq!(hours, vec!["10", "11"]);

    let opts = rows(
        &client,
        &format!(
            "SELECT * FROM slot_options WHERE room_id = '{room}' AND date = '2030-03-11' AND start_hour = 8"
        ),
    )
    .await;
    let end_at = |hour: &str| {
        opts.iter()
            .find(|r| r[0].as_deref() == Some("end") && r[1].as_deref() == Some(hour))
            .and_then(|r| r[2].clone())
    };
    assert_eq!(end_at("10").as_deref(), Some("t"));
    assert_eq!(end_at("11").as_deref(), Some("f"));
}

#[tokio::test]
async fn class_booking_lands_in_student_inbox() {
    let (addr, backend) = start_test_server().await;
    let client = connect(addr).await;
    let (room, class, instructor, student) = seed(&client).await;

    let created = client
        .query(
            r#"INSERT INTO bookings (room_id, user_id, class_id, title, start, "end")
               VALUES ($1, $2, $3, $4, $5, $6) RETURNING *"#,
            &[
                &room.to_string(),
                &instructor.to_string(),
                &class.to_string(),
                &"Lab practice",
                &"2030-03-11 09:00",
                &"2030-03-11 10:00",
            ],
        )
        .await
        .unwrap();
    assert_eq!(created.len(), 1);
    let booking_id: String = created[0].get("id");
    let class_id: Option<String> = created[0].get("class_id");
    assert_eq!(class_id, Some(class.to_string()));

    backend.engine.drain_notifications().await;
    let inbox = rows(&client, &format!("SELECT * FROM notifications WHERE user_id = '{student}'")).await;
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0][1].as_deref(), Some("Booking for your class"));
    assert!(inbox[0][2].as_deref().unwrap().contains("Lab practice"));

    client
        .batch_execute(&format!("DELETE FROM bookings WHERE id = '{booking_id}'"))
        .await
        .unwrap();
    backend.engine.drain_notifications().await;
    let inbox = rows(&client, &format!("SELECT * FROM notifications WHERE user_id = '{student}'")).await;
    assert_eq!(inbox.len(), 2);
    assert_eq!(inbox[0][1].as_deref(), Some("Booking cancelled"));

    // The instructor is not in the class and hears nothing.
    assert!(rows(&client, &format!("SELECT * FROM notifications WHERE user_id = '{instructor}'")).await.is_empty());
}

#[tokio::test]
async fn calendar_views_over_the_wire() {
    let (addr, _backend) = start_test_server().await;
    let client = connect(addr).await;
    let (room, class, instructor, _) = seed(&client).await;

    client
        .batch_execute(&format!(
            r#"INSERT INTO bookings (room_id, user_id, class_id, title, start, "end")
               VALUES ('{room}', '{instructor}', '{class}', 'Biology', '2030-03-11 09:00', '2030-03-11 11:00')"#
        ))
        .await
        .unwrap();

    let month = rows(&client, "SELECT * FROM month_calendar WHERE date = '2030-03-20'").await;
    assert_eq!(month.len(), 31);
    let day = month.iter().find(|r| r[0].as_deref() == Some("2030-03-11")).unwrap();
    assert_eq!(day[4].as_deref(), Some("1"));
    assert!(day[5].as_deref().unwrap().contains("Biology"));

    let timeline = rows(&client, "SELECT * FROM day_timeline WHERE date = '2030-03-11'").await;
    let nine = timeline.iter().find(|r| r[2].as_deref() == Some("9")).unwrap();
    assert_eq!(nine[4].as_deref(), Some("Biology"));
    assert_eq!(nine[5].as_deref(), Some("Marta"));
    assert_eq!(nine[6].as_deref(), Some("3B"));
    let ten = timeline.iter().find(|r| r[2].as_deref() == Some("10")).unwrap();
    assert!(ten[3].is_some());
    assert_eq!(ten[4], None);
}

#[tokio::test]
async fn bound_parameters_are_stored_verbatim() {
    let (addr, _backend) = start_test_server().await;
    let client = connect(addr).await;
    let (room, _, instructor, _) = seed(&client).await;

    let title = "Fee $1 for $2's lab";
    let created = client
        .query(
            r#"INSERT INTO bookings (room_id, user_id, title, start, "end")
               VALUES ($1, $2, $3, $4, $5) RETURNING *"#,
            &[
                &room.to_string(),
                &instructor.to_string(),
                &title,
                &"2030-03-12 09:00",
                &"2030-03-12 10:00",
            ],
        )
        .await
        .unwrap();
    let stored: String = created[0].get("title");
    assert_eq!(stored, title);

    let listed = client
        .query("SELECT * FROM bookings WHERE room_id = $1", &[&room.to_string()])
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].get::<_, String>("title"), title);
}

#[tokio::test]
async fn batch_runs_every_statement_until_one_fails() {
    let (addr, _backend) = start_test_server().await;
    let client = connect(addr).await;
    let (room, class, instructor, student) = seed(&client).await;

    client
        .batch_execute(&format!(
            r#"INSERT INTO bookings (room_id, user_id, class_id, start, "end")
               VALUES ('{room}', '{student}', '{class}', '2030-03-13 08:00', '2030-03-13 09:00');
               INSERT INTO bookings (room_id, user_id, start, "end")
               VALUES ('{room}', '{instructor}', '2030-03-13 09:00', '2030-03-13 10:00')"#
        ))
        .await
        .unwrap();
    assert_eq!(rows(&client, "SELECT * FROM bookings").await.len(), 2);

    let err = client
        .batch_execute(&format!(
            r#"INSERT INTO bookings (room_id, user_id, start, "end")
               VALUES ('{room}', '{instructor}', '2030-03-13 10:00', '2030-03-13 11:00');
               INSERT INTO bookings (room_id, user_id, start, "end")
               VALUES ('{room}', '{instructor}', '2030-03-13 08:30', '2030-03-13 09:30');
               INSERT INTO bookings (room_id, user_id, start, "end")
               VALUES ('{room}', '{instructor}', '2030-03-13 11:00', '2030-03-13 12:00')"#
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "23P01");
    // No transactions: the statement before the failure stays, the one after never ran.
    assert_eq!(rows(&client, "SELECT * FROM bookings").await.len(), 3);
}
