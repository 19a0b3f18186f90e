use comcom::Session;
use std::time::Duration;

/// Runs `cat` over some input and prints what comes back, then shows a
/// timed-out invocation getting cut short, the way the original C test
/// suite's `test_short_cat` / timeout scenarios do.
fn main() {
    std::env::set_var("RUST_LOG", "trace");
    env_logger::init();

    let session = Session::init().expect("failed to initialize comcom session");

    let output = session
        .run(b"hello from comcom\n", "cat", &["cat"], None, Some(Duration::from_secs(5)))
        .expect("cat invocation failed");
    println!("{}", String::from_utf8_lossy(&output));

    let timeout_result = session.run(b"", "sleep", &["sleep", "10"], None, Some(Duration::from_millis(200)));
    println!("sleep with 200ms timeout: {:?}", timeout_result);
}
