mod common;
use common::*;

use chrono::{TimeZone, Utc};

#[test]
fn test_append_to_tag_table_then_count() {
    let db = tag_data_db(StrataConfig::default());
    let conn = connect(&db);
    let mut app = conn.appender(&Context::background(), "tag_data").unwrap();
    let now = Value::datetime(Utc::now());
    for _ in 0..10_000 {
        app.append(&[Value::from("t"), now.clone(), Value::Float64(1.5)])
            .unwrap();
    }
    assert_eq!(app.close().unwrap(), (10_000, 0));
    assert_eq!(count_rows(&db, "tag_data"), 10_000);
}

#[test]
fn test_parameterized_insert_then_select() {
    let db = tag_data_db(StrataConfig::default());
    let conn = connect(&db);
    let ctx = Context::background();
    let ts = Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap();
    let res = conn
        .exec(
            &ctx,
            "insert into tag_data values(?, ?, ?)",
            &[Value::from("x"), Value::datetime(ts), Value::Float64(1.23)],
        )
        .unwrap();
    assert_eq!(res.rows_affected, 1);

    let mut rows = conn
        .query(
            &ctx,
            "select name, time, value from tag_data where name = ?",
            &[Value::from("x")],
        )
        .unwrap();
    assert!(rows.next());
    let (name, time, value): (String, chrono::DateTime<Utc>, f64) = rows.scan().unwrap();
    assert_eq!(name, "x");
    assert_eq!(time, ts);
    assert_eq!(value, 1.23);
    assert!(!rows.next());
    assert!(rows.err().is_none());
    rows.close().unwrap();
}

#[test]
fn test_statement_type_messages() {
    let db = default_db();
    let conn = connect(&db);
    let ctx = Context::background();
    let created = conn
        .exec(&ctx, "create table msgs (a integer)", &[])
        .unwrap();
    assert_eq!(created.message, "Created successfully.");

    let inserted = conn
        .exec(&ctx, "insert into msgs values (?)", &[Value::Int32(1)])
        .unwrap();
    assert_eq!(inserted.message, "a row inserted.");
    exec(&conn, "insert into msgs values (2)");
    exec(&conn, "insert into msgs values (3)");

    let deleted = conn
        .exec(&ctx, "delete from msgs where a = ?", &[Value::Int32(99)])
        .unwrap();
    assert_eq!(deleted.message, "no rows deleted.");

    let mut rows = conn.query(&ctx, "select a from msgs", &[]).unwrap();
    while rows.next() {}
    assert_eq!(rows.message(), "3 rows fetched.");
    rows.close().unwrap();
}

#[test]
fn test_admission_backpressure() {
    let mut cfg = StrataConfig::default();
    cfg.database.max_open_conns = 2;
    let db = start_db(cfg);
    let ctx = Context::background();
    let first = connect(&db);
    let _second = connect(&db);

    let start = Instant::now();
    let err = db
        .connect(
            &ctx,
            &[
                ConnectOption::trust("sys"),
                ConnectOption::Timeout(Duration::from_millis(100)),
            ],
        )
        .unwrap_err();
    assert!(matches!(err, StrataError::ConnectTimeout));
    assert!(start.elapsed() >= Duration::from_millis(100));

    let waiter_db = db.clone();
    let waiter = std::thread::spawn(move || {
        waiter_db.connect(
            &Context::background(),
            &[
                ConnectOption::trust("sys"),
                ConnectOption::Timeout(Duration::from_secs(5)),
            ],
        )
    });
    std::thread::sleep(Duration::from_millis(50));
    first.close().unwrap();
    let third = waiter.join().unwrap().unwrap();
    assert!(third.is_connected());
}

#[test]
fn test_tag_watcher_emits_new_rows_once() {
    let db = default_db();
    let conn = connect(&db);
    exec(
        &conn,
        "create tag table tag (name varchar(20) primary key, time datetime basetime, value double)",
    );
    let factory_db = db.clone();
    let factory: strata_access::ConnFactory = Arc::new(move || {
        factory_db.connect(&Context::background(), &[ConnectOption::trust("sys")])
    });
    let mut opts = WatchOptions::new("tag", factory).with_tags(["tag1", "tag2"]);
    opts.time_format = "rfc3339".into();
    let watcher = Watcher::new(&Context::background(), opts).unwrap();

    let t1 = Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap();
    conn.exec(
        &Context::background(),
        "insert into tag values (?, ?, ?)",
        &[Value::from("tag1"), Value::datetime(t1), Value::Float64(3.0)],
    )
    .unwrap();

    watcher.execute().unwrap().join();
    let items: Vec<WatchData> = watcher.receiver().try_iter().collect();
    assert_eq!(items.len(), 1);
    let WatchData::Record(record) = &items[0] else {
        panic!("expected a record, got {:?}", items[0]);
    };
    assert_eq!(record["NAME"], Value::from("tag1"));
    assert_eq!(record["TIME"], Value::from("2024-05-06T07:08:09Z"));

    watcher.execute().unwrap().join();
    assert!(watcher.receiver().try_recv().is_err());
    watcher.close();
}
