use std::{sync::Arc, thread, time::Duration};

use parking_lot::Mutex;
use rstest::rstest;
use tether_bus_common::{
    Error, Value, ERROR_FAILED, ERROR_NO_REPLY, ERROR_SERVICE_UNKNOWN, ERROR_UNKNOWN_METHOD,
    WORKER_INTERFACE_PREFIX,
};
use tether_bus_lib::{
    connection::is_no_reply,
    message::Arg,
    native::{FilterResult, MessageKind, NativeConnection, RawMessage},
    Message,
};

mod fixture;
use fixture::{make_fixture, Fixture, MockService};

const SCREENSAVER: &str = "org.gnome.ScreenSaver";
const SCREENSAVER_PATH: &str = "/org/gnome/ScreenSaver";
const BLOCKING_TIMEOUT: Duration = Duration::from_secs(2);

fn screensaver(fixture: &Fixture) -> MockService {
    MockService::start(fixture.bus(), SCREENSAVER, |call| {
        match call.member.as_deref() {
            Some("GetActiveTime") => {
                let mut reply = RawMessage::method_return(call);
                reply.args.push(Value::UInt32(42));
                Some(reply)
            }
            Some("Lock") => Some(RawMessage::error_reply(
                call,
                "org.gnome.ScreenSaver.Error.Busy",
                "Screen is busy",
            )),
            // Echo arguments back
            Some("Echo") => {
                let mut reply = RawMessage::method_return(call);
                reply.args = call.args.clone();
                Some(reply)
            }
            _ => None,
        }
    })
}

#[rstest]
fn test_blocking_call(#[from(make_fixture)] fixture: Fixture) {
    let _service = screensaver(&fixture);
    let (connection, _) = fixture.connect("caller");

    let call = Message::method_call(SCREENSAVER, SCREENSAVER_PATH, SCREENSAVER, "GetActiveTime");
    let mut reply = connection
        .call_blocking(&call, BLOCKING_TIMEOUT)
        .expect("Failed to call");

    assert!(reply.is_ok());
    assert_eq!(reply.kind(), MessageKind::MethodReturn);
    assert_eq!(reply.name(), "caller");
    assert_eq!(reply.pop_as::<u32>(), Ok(42));
    assert_eq!(reply.pop_as::<u32>(), Err(Error::EndOfArguments));
}

#[rstest]
fn test_blocking_call_error(#[from(make_fixture)] fixture: Fixture) {
    let _service = screensaver(&fixture);
    let (connection, _) = fixture.connect("caller");

    let call = Message::method_call(SCREENSAVER, SCREENSAVER_PATH, SCREENSAVER, "Lock");
    let reply = connection.call_blocking(&call, BLOCKING_TIMEOUT).unwrap();

    assert!(reply.failed());
    assert_eq!(reply.error_name(), Some("org.gnome.ScreenSaver.Error.Busy"));
    assert_eq!(reply.error_message(), Some("Screen is busy"));
    assert_eq!(
        reply.to_string(),
        "org.gnome.ScreenSaver.Error.Busy: Screen is busy"
    );

    assert_eq!(
        reply.into_result().unwrap_err(),
        Error::Remote {
            name: "org.gnome.ScreenSaver.Error.Busy".into(),
            message: "Screen is busy".into()
        }
    );
}

#[rstest]
fn test_unknown_service(#[from(make_fixture)] fixture: Fixture) {
    let (connection, _) = fixture.connect("caller");

    let call = Message::method_call("org.example.Missing", "/", "org.example.Missing", "Ping");
    let reply = connection.call_blocking(&call, BLOCKING_TIMEOUT).unwrap();

    assert!(reply.failed());
    assert_eq!(reply.error_name(), Some(ERROR_SERVICE_UNKNOWN));
}

#[rstest]
fn test_blocking_call_timeout(#[from(make_fixture)] fixture: Fixture) {
    let silent = fixture.peer();
    silent.request_name("org.example.Silent").unwrap();
    let (connection, _) = fixture.connect("caller");

    let call = Message::method_call("org.example.Silent", "/", "org.example.Silent", "Ping");
    let reply = connection
        .call_blocking(&call, Duration::from_millis(50))
        .unwrap();

    assert!(is_no_reply(&reply));
}

#[rstest]
fn test_async_call_timeout(#[from(make_fixture)] fixture: Fixture) {
    let silent = fixture.peer();
    silent.request_name("org.example.Silent").unwrap();
    let (connection, native) = fixture.connect("caller");

    let reply: Arc<Mutex<Option<Message>>> = Arc::new(Mutex::new(None));
    let slot = reply.clone();

    let call = Message::method_call("org.example.Silent", "/", "org.example.Silent", "Ping");
    connection
        .call_with_timeout(&call, Duration::from_millis(50), move |m| {
            *slot.lock() = Some(m)
        })
        .unwrap();
    assert_eq!(native.pending_replies(), 1);

    assert!(fixture.wait_for(|| reply.lock().is_some()));

    let reply = reply.lock().take().unwrap();
    assert!(reply.failed());
    assert_eq!(reply.error_name(), Some(ERROR_NO_REPLY));
    assert_eq!(native.pending_replies(), 0);
}

#[rstest]
fn test_callback_call(#[from(make_fixture)] fixture: Fixture) {
    let _service = screensaver(&fixture);
    let (connection, _) = fixture.connect("caller");

    let reply: Arc<Mutex<Option<u32>>> = Arc::new(Mutex::new(None));
    let slot = reply.clone();

    connection
        .call(
            SCREENSAVER,
            SCREENSAVER_PATH,
            SCREENSAVER,
            "GetActiveTime",
            move |mut message| *slot.lock() = message.pop_as().ok(),
        )
        .unwrap();

    assert!(fixture.wait_for(|| reply.lock().is_some()));
    assert_eq!(*reply.lock(), Some(42));
}

#[rstest]
fn test_echo_arguments(#[from(make_fixture)] fixture: Fixture) {
    let _service = screensaver(&fixture);
    let (connection, _) = fixture.connect("caller");

    let call = Message::with_args(
        SCREENSAVER,
        SCREENSAVER_PATH,
        SCREENSAVER,
        "Echo",
        vec![
            Arg::from(true),
            Arg::from(-7i16),
            Arg::from(65000u16),
            Arg::from(-70000i32),
            Arg::from(4_000_000_000u32),
            Arg::from(i64::MIN),
            Arg::from(u64::MAX),
            Arg::from("text"),
            Arg::from(&["a", "b"][..]),
        ],
    )
    .unwrap();

    let mut reply = connection.call_blocking(&call, BLOCKING_TIMEOUT).unwrap();
    assert!(reply.is_ok());

    assert_eq!(reply.pop_as::<bool>(), Ok(true));
    assert_eq!(reply.pop_as::<i16>(), Ok(-7));
    assert_eq!(reply.pop_as::<u16>(), Ok(65000));
    assert_eq!(reply.pop_as::<i32>(), Ok(-70000));
    assert_eq!(reply.pop_as::<u32>(), Ok(4_000_000_000));
    assert_eq!(reply.pop_as::<i64>(), Ok(i64::MIN));
    assert_eq!(reply.pop_as::<u64>(), Ok(u64::MAX));
    assert_eq!(reply.pop_as::<String>(), Ok("text".to_owned()));
    assert_eq!(
        reply.pop_as::<Vec<String>>(),
        Ok(vec!["a".to_owned(), "b".to_owned()])
    );
    assert_eq!(reply.remaining().len(), 0);
}

#[rstest]
#[tokio::test]
async fn test_async_call(#[from(make_fixture)] fixture: Fixture) {
    let _service = screensaver(&fixture);
    let (connection, _) = fixture.connect("caller");
    let _loop_thread = fixture.spawn_loop();

    let call = Message::method_call(SCREENSAVER, SCREENSAVER_PATH, SCREENSAVER, "GetActiveTime");
    let mut reply = connection.call_async(&call).await.expect("Failed to call");

    assert_eq!(reply.pop_as::<u32>(), Ok(42));
}

#[rstest]
fn test_reply_error(#[from(make_fixture)] fixture: Fixture) {
    let (connection, native) = fixture.connect("service");
    let destination = connection.unique_name().unwrap();

    // Takes the calls the connection filter leaves unhandled
    let calls: Arc<Mutex<Vec<Arc<RawMessage>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = calls.clone();
    native.add_filter(Arc::new(move |message: &Arc<RawMessage>| {
        if message.kind != MessageKind::MethodCall {
            return FilterResult::NotYetHandled;
        }

        sink.lock().push(message.clone());
        FilterResult::Handled
    }));

    let caller = fixture.peer();
    let handle = thread::spawn(move || {
        let call = RawMessage::method_call(&destination, "/", "org.example.Service", "Run");
        caller.send_with_reply_and_block(&call, BLOCKING_TIMEOUT)
    });

    assert!(fixture.wait_for(|| !calls.lock().is_empty()));

    let call = Message::from_raw(calls.lock()[0].clone());
    assert_eq!(call.member(), Some("Run"));
    connection
        .reply_error(&call, &Error::Callback("boom".into()))
        .unwrap();

    let reply = handle.join().unwrap().expect("Failed to receive a reply");
    assert_eq!(reply.kind, MessageKind::Error);
    assert_eq!(reply.error_name.as_deref(), Some(ERROR_FAILED));
    assert_eq!(reply.error_text(), Some("Callback failed: boom"));
}

#[rstest]
#[case::exact(WORKER_INTERFACE_PREFIX.to_owned())]
#[case::mixed_case(WORKER_INTERFACE_PREFIX.to_uppercase())]
fn test_worker_call_not_handled(#[from(make_fixture)] fixture: Fixture, #[case] prefix: String) {
    let (connection, _) = fixture.connect("service");
    let destination = connection.unique_name().unwrap();
    let _loop_thread = fixture.spawn_loop();

    let interface = format!("{prefix}Worker");
    let call = RawMessage::method_call(&destination, "/", &interface, "Start");
    let reply = fixture
        .peer()
        .send_with_reply_and_block(&call, BLOCKING_TIMEOUT)
        .expect("Failed to receive a reply");

    assert_eq!(reply.kind, MessageKind::Error);
    assert_eq!(reply.error_name.as_deref(), Some(ERROR_UNKNOWN_METHOD));
}

#[rstest]
fn test_closed_connection_call(#[from(make_fixture)] fixture: Fixture) {
    let (connection, native) = fixture.connect("caller");
    native.close();

    let call = Message::method_call(SCREENSAVER, SCREENSAVER_PATH, SCREENSAVER, "GetActiveTime");
    assert_eq!(
        connection.call_blocking(&call, BLOCKING_TIMEOUT).unwrap_err(),
        Error::Closed
    );
    assert_eq!(
        connection.call_message(&call, |_| {}).unwrap_err(),
        Error::Closed
    );
}
