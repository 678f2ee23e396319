mod common;

use common::*;

#[tokio::test]
async fn test_query_fetch_until_no_rows() {
    let s = server();
    let h = login(&s).await;
    exec(&s, &h, "create table logs (msg varchar(20), n integer)").await;
    for i in 0..3 {
        let r = s
            .exec(
                &h,
                "insert into logs values (?, ?)",
                vec![Value::from(format!("m{}", i)), Value::Int32(i)],
            )
            .await;
        assert!(r.success, "{}", r.reason);
        assert_eq!(r.body.unwrap().rows_affected, 1);
    }

    let r = s.query(&h, "select msg, n from logs order by n", vec![]).await;
    assert!(r.success, "{}", r.reason);
    let rows = r.body.unwrap().rows_handle.expect("fetchable");

    let cols = s.columns(&rows).await.body.unwrap().columns;
    let names: Vec<&str> = cols.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["MSG", "N"]);

    let mut seen = Vec::new();
    loop {
        let r = s.rows_fetch(&rows).await;
        assert!(r.success, "{}", r.reason);
        let body = r.body.unwrap();
        if body.has_no_rows {
            break;
        }
        seen.push(body.values);
    }
    assert_eq!(seen.len(), 3);
    assert_eq!(seen[0], vec![Value::from("m0"), Value::Int32(0)]);

    // fetching past the end keeps reporting the end
    assert!(s.rows_fetch(&rows).await.body.unwrap().has_no_rows);

    assert!(s.rows_close(&rows).await.success);
    assert!(s.rows_close(&rows).await.success);
    assert_eq!(s.inflight_count(), 0);
    let db = s.database();
    assert_eq!(
        db.metrics().snapshot().stmt.opened,
        db.metrics().snapshot().stmt.closed
    );
}

#[tokio::test]
async fn test_query_row_and_explain() {
    let s = server();
    let h = login(&s).await;
    exec(&s, &h, TAG_DATA_DDL).await;
    let r = s
        .exec(
            &h,
            "insert into tag_data values (?, ?, ?)",
            vec![Value::from("a"), Value::Datetime(1_000), Value::Float64(1.5)],
        )
        .await;
    assert!(r.success, "{}", r.reason);

    let r = s
        .query_row(&h, "select value from tag_data where name = ?", vec![Value::from("a")])
        .await;
    assert!(r.success, "{}", r.reason);
    let body = r.body.unwrap();
    assert_eq!(body.values, vec![Value::Float64(1.5)]);
    assert_eq!(body.columns.len(), 1);

    let r = s
        .query_row(&h, "select value from tag_data where name = ?", vec![Value::from("zz")])
        .await;
    assert!(!r.success);
    assert_eq!(r.reason, "sql: no rows in result set");

    let r = s.explain(&h, "select * from tag_data", false).await;
    assert!(r.success, "{}", r.reason);
    assert!(!r.body.unwrap().plan.is_empty());
}

#[tokio::test]
async fn test_append_stream_counts() {
    let s = server();
    let h = login(&s).await;
    exec(&s, &h, TAG_DATA_DDL).await;
    let (_sess, app) = open_appender(&s, "tag_data").await;
    assert_eq!(s.list_inflight()[0].kind, InflightKind::Appender);

    let (tx, rx) = mpsc::channel(4);
    let task = {
        let s = s.clone();
        tokio::spawn(async move { s.append(rx).await })
    };
    for batch in 0..10i64 {
        let records = (0..10i64)
            .map(|i| {
                vec![
                    Value::from("tag-0"),
                    Value::Datetime(batch * 10 + i + 1),
                    Value::Float64(i as f64),
                ]
            })
            .collect();
        tx.send(AppendMessage::new(app.clone(), records)).await.unwrap();
    }
    drop(tx);

    let done = task.await.unwrap();
    assert!(done.success, "{}", done.reason);
    assert_eq!(
        done.body,
        Some(AppendDone {
            success_count: 100,
            fail_count: 0
        })
    );
    assert_eq!(s.inflight_count(), 0);
    assert_eq!(count(&s, "tag_data").await, 100);
}

#[tokio::test]
async fn test_append_reports_failed_close() {
    let s = server();
    let h = login(&s).await;
    exec(&s, &h, TAG_DATA_DDL).await;
    let r = s.appender(&h, "tag_data").await;
    assert!(r.success, "{}", r.reason);
    let app = r.body.expect("appender body").handle;
    let sessions = s.database().list_sessions();
    assert_eq!(sessions.len(), 1);
    let session_id = sessions[0].id;

    let (tx, rx) = mpsc::channel(4);
    let task = {
        let s = s.clone();
        tokio::spawn(async move { s.append(rx).await })
    };
    let records = (0..3i64)
        .map(|i| vec![Value::from("tag-0"), Value::Datetime(i + 1), Value::Float64(1.0)])
        .collect();
    tx.send(AppendMessage::new(app.clone(), records)).await.unwrap();

    // wait until the records reached the engine before the session dies
    let mut appended = 0;
    for _ in 0..200 {
        appended = count(&s, "tag_data").await;
        if appended == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(appended, 3);

    s.database().kill_session(session_id, true).unwrap();
    drop(tx);

    let done = task.await.unwrap();
    assert!(!done.success);
    assert!(done.body.is_none());
    assert!(!done.reason.is_empty());
    assert_eq!(s.inflight_count(), 0);
}

#[tokio::test]
async fn test_append_rejects_handle_change() {
    let s = server();
    let h = login(&s).await;
    exec(&s, &h, TAG_DATA_DDL).await;
    let (_s1, first) = open_appender(&s, "tag_data").await;
    let (_s2, second) = open_appender(&s, "tag_data").await;

    let (tx, rx) = mpsc::channel(4);
    tx.send(AppendMessage::new(first.clone(), vec![])).await.unwrap();
    tx.send(AppendMessage::new(second.clone(), vec![])).await.unwrap();
    drop(tx);

    let done = s.append(rx).await;
    assert!(!done.success);
    assert_eq!(done.reason, "not allowed changing handle in a stream");
    // the stream's own appender is released, the other one stays
    assert_eq!(s.inflight_count(), 1);
    assert_eq!(s.list_inflight()[0].id, second);
}

#[tokio::test]
async fn test_append_unknown_handle() {
    let s = server();
    let (tx, rx) = mpsc::channel(1);
    tx.send(AppendMessage::new("0x1#99", vec![])).await.unwrap();
    drop(tx);
    let done = s.append(rx).await;
    assert!(!done.success);
    assert_eq!(done.reason, "handle '0x1#99' not found");
}

#[tokio::test]
async fn test_append_wrong_width_fails_stream() {
    let s = server();
    let h = login(&s).await;
    exec(&s, &h, TAG_DATA_DDL).await;
    let (_sess, app) = open_appender(&s, "tag_data").await;

    let (tx, rx) = mpsc::channel(2);
    tx.send(AppendMessage::new(app.clone(), vec![vec![Value::from("only-name")]]))
        .await
        .unwrap();
    drop(tx);
    let done = s.append(rx).await;
    assert!(!done.success);
    assert!(done.reason.contains("requires 3 columns"), "{}", done.reason);
    assert_eq!(s.inflight_count(), 0);
}

#[tokio::test]
async fn test_rows_handle_is_not_an_appender() {
    let s = server();
    let h = login(&s).await;
    exec(&s, &h, "create table logs (msg varchar(20))").await;
    let (_sess, app) = open_appender(&s, "logs").await;

    let r = s.rows_fetch(&app).await;
    assert!(!r.success);
    assert_eq!(r.reason, format!("handle '{}' is not valid", app));
    let r = s.rows_close(&app).await;
    assert!(!r.success);
    assert_eq!(s.inflight_count(), 1);
}

struct PanickyHandles;

#[async_trait::async_trait]
impl AuthProvider for PanickyHandles {
    async fn validate_user_otp(&self, _user: &str, _otp: &str) -> StrataResult<bool> {
        Ok(false)
    }

    fn generate_handle(&self) -> String {
        panic!("handle generator exploded")
    }
}

#[tokio::test]
async fn test_handler_panic_becomes_failure() {
    let s = RpcServer::with_auth_provider(start_db(), RpcConfig::default(), Arc::new(PanickyHandles));
    let r = s.conn("sys", "manager").await;
    assert!(!r.success);
    assert!(r.reason.contains("handle generator exploded"), "{}", r.reason);
    // still serving
    assert!(s.ping(7).await.success);
    assert_eq!(s.session_count(), 0);
}
