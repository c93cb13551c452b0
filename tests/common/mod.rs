#![allow(dead_code)]

use seplosbms_lib::protocol::{checksum, Address};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

pub const TELEMETRY_INFO: &str = concat!(
    "0001", "02", "0CE4", "0CE5", "02", "0AAB", "0E93", "FF9C", "1482", "2710", "0A", "2710",
    "03E8", "2710", "0010", "03E8", "1482"
);

pub const ALARM_INFO: &str = concat!(
    "0001", "02", "00", "01", "01", "02", "00", "03", "14", "0102030405060708", "0A", "0B0C",
    "0D", "0E0F"
);

pub fn address(n: u8) -> Address {
    Address::new(n).unwrap()
}

/// A response frame as a pack sends it, the address is hex coded.
pub fn response(address: u8, info: &str) -> String {
    let payload = format!("20{address:02X}4600{:04X}{info}", info.len());
    format!("~{payload}{}\r", checksum(&payload))
}

/// Answers of a healthy pack: telemetry for CID2 42, alarms for CID2 44.
pub fn healthy_pack(address: u8, cid2: &str) -> Option<String> {
    match cid2 {
        "42" => Some(response(address, TELEMETRY_INFO)),
        "44" => Some(response(address, ALARM_INFO)),
        _ => None,
    }
}

pub async fn read_frame<R: AsyncBufRead + Unpin>(device: &mut R) -> String {
    let mut frame = Vec::new();
    device.read_until(b'\r', &mut frame).await.unwrap();
    String::from_utf8(frame).unwrap()
}

/// Simulates the packs on the bus: every request frame is logged and answered by `answer`
/// with the request address and CID2. `None` leaves the request unanswered.
pub fn spawn_bus<F>(stream: DuplexStream, answer: F) -> Arc<Mutex<Vec<String>>>
where
    F: Fn(u8, &str) -> Option<String> + Send + 'static,
{
    let requests = Arc::new(Mutex::new(Vec::new()));
    let log = requests.clone();
    tokio::spawn(async move {
        let mut bus = BufReader::new(stream);
        loop {
            let request = read_frame(&mut bus).await;
            if request.is_empty() {
                break;
            }
            let address: u8 = request[3..5].parse().unwrap();
            let reply = answer(address, &request[7..9]);
            log.lock().unwrap().push(request);
            if let Some(reply) = reply {
                if bus.write_all(reply.as_bytes()).await.is_err() {
                    break;
                }
            }
        }
    });
    requests
}
