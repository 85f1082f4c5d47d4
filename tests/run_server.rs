use rand::Rng;
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::panic::UnwindSafe;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;

lazy_static::lazy_static! {
    static ref COMPILED_BINARY_PATH: PathBuf = assert_cmd::cargo::cargo_bin("catflap");
}

/// The given test closure must accept ephemeral server port as argument
fn with_server(passphrases: &str, test: impl FnOnce(u16) + UnwindSafe) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let random_port = rand::thread_rng().gen_range(20_000_u16..50_000_u16);

    let passfile = dir.path().join("passfile.yaml");
    std::fs::write(&passfile, passphrases).unwrap();

    let config_file = dir.path().join("config.yaml");
    std::fs::write(
        &config_file,
        format!(
            "server:\n  listen_addr: 127.0.0.1\n  port: {}\n  passfile: {}\n  redirect_url: http://localhost/\nfirewall:\n  plugin: none\n  dports: 80,443\n",
            random_port,
            passfile.display()
        ),
    )
    .unwrap();

    let mut server = std::process::Command::new(&*COMPILED_BINARY_PATH)
        .arg("--config-file")
        .arg(&config_file)
        .arg("--pid-file")
        .arg(dir.path().join("catflap.pid"))
        .arg("start")
        .spawn()
        .expect("Failed to launch server");

    std::thread::sleep(Duration::from_millis(500));

    let test_result = std::panic::catch_unwind(|| test(random_port));

    let _ = server.kill();
    server.wait().expect("Failed to join server");

    test_result.expect("Test failed");
}

#[must_use]
fn get(port: u16, target: &str) -> String {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).expect("Failed to connect");
    write!(
        stream,
        "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        target
    )
    .unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();
    response
}

#[must_use]
fn body(response: &str) -> serde_json::Value {
    let (_, body) = response.split_once("\r\n\r\n").expect("No HTTP body");
    serde_json::from_str(body).expect("Body is not JSON")
}

fn token(phrase: &str, nonce: &str) -> String {
    hex::encode(Sha256::digest(format!("{}{}", phrase, nonce)))
}

#[test]
fn knock_from_localhost() {
    with_server("passphrases:\n  - frisky kitten\n", |port| {
        let synced = body(&get(port, "/catflap/sync"));
        assert_eq!(synced["Status"], "Handshake sync OK");
        assert_eq!(synced["StatusCode"], 200);

        let ts = synced["Timestamp"].as_i64().unwrap().to_string();
        let response = body(&get(
            port,
            &format!(
                "/catflap/knock?_key=frisky&ts={}&token={}",
                ts,
                token("frisky kitten", &ts)
            ),
        ));
        assert_eq!(
            response,
            serde_json::json!({
                "Status": "Authenticated",
                "StatusCode": 200,
                "RedirectUrl": "http://localhost/",
            })
        );
    })
}

#[test]
fn rejected_knocks() {
    with_server("passphrases:\n  frisky: frisky kitten\n", |port| {
        let ts = body(&get(port, "/catflap/sync"))["Timestamp"]
            .as_i64()
            .unwrap()
            .to_string();

        let wrong_phrase = body(&get(
            port,
            &format!(
                "/catflap/knock?_key=frisky&ts={}&token={}",
                ts,
                token("grumpy cat", &ts)
            ),
        ));
        assert_eq!(wrong_phrase["Status"], "Authentication failed");
        assert_eq!(wrong_phrase["StatusCode"], 401);
        assert!(wrong_phrase.get("RedirectUrl").is_none());

        let unknown_key = body(&get(
            port,
            &format!(
                "/catflap/knock?_key=grumpy&ts={}&token={}",
                ts,
                token("frisky kitten", &ts)
            ),
        ));
        assert_eq!(unknown_key["StatusCode"], 401);

        let expired = body(&get(
            port,
            &format!(
                "/catflap/knock?_key=frisky&ts=1000&token={}",
                token("frisky kitten", "1000")
            ),
        ));
        assert_eq!(expired["Status"], "Expired Token");
        assert_eq!(expired["StatusCode"], 405);

        assert_eq!(body(&get(port, "/catflap/knock"))["StatusCode"], 401);
        assert!(get(port, "/catflap/open").starts_with("HTTP/1.1 404"));
    })
}
