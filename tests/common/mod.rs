#![allow(dead_code)]

use pcap::{Capture, Linktype, Packet, PacketHeader};
use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;

use flowstat::models::config::{
    AppConfig, CursorConfig, OutputConfig, SinkConfig, SizeRecordConfig, UploadSource,
};

pub const AGG_TABLE: &str = "interval_traffic";

/// Ethernet + IPv4 + UDP frame of 60 bytes
pub fn udp_frame(src: [u8; 4], dst: [u8; 4]) -> Vec<u8> {
    let payload = 18;
    let ip_total = 20 + 8 + payload;
    let mut f = vec![0u8; 12];
    f.extend_from_slice(&[0x08, 0x00]);
    f.extend_from_slice(&[0x45, 0, 0, ip_total as u8, 0, 0, 0, 0, 64, 17, 0, 0]);
    f.extend_from_slice(&src);
    f.extend_from_slice(&dst);
    f.extend_from_slice(&[0x30, 0x39, 0x00, 0x35, 0, (8 + payload) as u8, 0, 0]);
    f.extend(std::iter::repeat(0u8).take(payload));
    f
}

/// Write `frames` to a capture file, one second apart from `start_secs`
pub fn write_capture(path: &Path, start_secs: i64, frames: &[Vec<u8>]) {
    let dead = Capture::dead(Linktype::ETHERNET).unwrap();
    let mut savefile = dead.savefile(path).unwrap();
    for (i, data) in frames.iter().enumerate() {
        let header = PacketHeader {
            ts: libc::timeval {
                tv_sec: (start_secs + i as i64) as _,
                tv_usec: 0,
            },
            caplen: data.len() as u32,
            len: data.len() as u32,
        };
        savefile.write(&Packet::new(&header, data));
    }
    savefile.flush().unwrap();
}

pub fn size_record(db_file: &Path) -> SizeRecordConfig {
    SizeRecordConfig {
        interval: Duration::from_secs(60),
        timeout: Duration::from_secs(30),
        retry_times: 0,
        sink: SinkConfig::Sqlite {
            db_file: db_file.to_path_buf(),
            table: AGG_TABLE.to_string(),
        },
    }
}

/// Upload-only config over `dir/pcap`, all state files inside `dir`
pub fn backlog_config(dir: &Path, cursor: CursorConfig) -> AppConfig {
    let mut config = AppConfig::default();
    config.capture.enabled = false;
    config.upload.enabled = true;
    config.upload.source = UploadSource::File;
    config.upload.pcap_dir = dir.join("pcap");
    config.upload.cursor = cursor;
    config.handler.id_file = dir.join("id.bin");
    config.handler.channel_size = 2;
    config.handler.record_channel_size = 8;
    config.outputs = vec![OutputConfig::SizeRecord(size_record(&dir.join("agg.db")))];
    config.validate().unwrap();
    config
}

pub fn sqlite_cursor(dir: &Path) -> CursorConfig {
    CursorConfig::Sqlite {
        db_file: dir.join("cursor.db"),
    }
}

pub fn file_cursor(dir: &Path) -> CursorConfig {
    CursorConfig::File {
        file: dir.join("cursor.json"),
        flush_interval: Duration::from_secs(5),
    }
}

/// (rows, total packets, total bytes) in the aggregate table
pub fn aggregate_totals(db_file: &Path) -> (i64, i64, i64) {
    let conn = Connection::open(db_file).unwrap();
    conn.query_row(
        &format!(
            "SELECT COUNT(*), COALESCE(SUM(packet_count), 0), COALESCE(SUM(packet_size), 0) FROM {}",
            AGG_TABLE
        ),
        [],
        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
    )
    .unwrap()
}
