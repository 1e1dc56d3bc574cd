#![allow(missing_docs)]

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use sombra_durable::operation::{OpBlock, Operator};
use sombra_durable::replication::protocol::{PROTOCOL, VERSION};
use sombra_durable::replication::{
    AttachMode, Endpoint, ProducerOptions, Response, TransactionalProducer,
};
use sombra_durable::{ObjectId, Result};

struct Session {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl Session {
    fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = listener.accept().expect("accept");
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .expect("timeout");
        let writer = stream.try_clone().expect("clone");
        Self {
            reader: BufReader::new(stream),
            writer,
        }
    }

    /// Reads lines until one starts with `prefix`, returning all of them.
    fn until(&mut self, prefix: &str) -> Vec<String> {
        let mut lines = Vec::new();
        loop {
            let mut line = String::new();
            assert!(self.reader.read_line(&mut line).expect("read") > 0, "producer hung up");
            let done = line.starts_with(prefix);
            lines.push(line);
            if done {
                return lines;
            }
        }
    }

    fn handshake(&mut self) {
        self.until("ATTACH");
        self.reply(&Response::Attach {
            protocol: PROTOCOL,
            version: VERSION,
            fingerprint: ObjectId::from_name("replica"),
            adminport: 0,
        });
    }

    /// Reads one framed transaction and returns its id, CRC and lines.
    fn transaction(&mut self) -> (ObjectId, u32, Vec<String>) {
        let lines = self.until("COMMIT");
        let commit = lines.last().expect("commit line");
        let mut fields = commit.split_whitespace().skip(1);
        let txid: ObjectId = fields.next().expect("txid").parse().expect("obid");
        fields.next();
        let crc = u32::from_str_radix(fields.next().expect("crc"), 16).expect("crc");
        (txid, crc, lines)
    }

    fn reply(&mut self, response: &Response) {
        self.writer.write_all(&response.to_bytes()).expect("reply");
    }
}

fn block(tick: u64) -> Vec<u8> {
    OpBlock::for_graph(ObjectId::from_name("origin"), Operator::tick(tick)).to_bytes()
}

#[test]
fn reconnect_retransmits_only_unacknowledged_transactions() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let address = listener.local_addr()?.to_string();
    let server = thread::spawn(move || {
        let mut first = Session::accept(&listener);
        first.handshake();
        let sent: Vec<_> = (0..3).map(|_| first.transaction()).collect();
        for (txid, crc, _) in &sent[..2] {
            first.reply(&Response::Accepted { txid: *txid, crc: *crc });
        }
        // Give the producer time to read both acknowledgements before the hangup.
        thread::sleep(Duration::from_millis(200));
        drop(first);

        let mut second = Session::accept(&listener);
        second.handshake();
        let (txid, crc, lines) = second.transaction();
        second.reply(&Response::Accepted { txid, crc });
        let ids: Vec<ObjectId> = sent.iter().map(|(id, _, _)| *id).collect();
        (ids, txid, lines)
    });

    let options = ProducerOptions {
        handshake: true,
        reconnect_min: Duration::from_millis(10),
        reconnect_max: Duration::from_millis(50),
        poll_interval: Duration::from_millis(1),
        ..ProducerOptions::default()
    };
    let mut producer = TransactionalProducer::new(Endpoint::Tcp(address), AttachMode::Normal, options);
    producer.attach()?;
    for tick in 1..=3 {
        producer.commit(&block(tick), 0)?;
    }
    let deadline = Instant::now() + Duration::from_secs(10);
    while producer.pending_len() > 0 {
        assert!(Instant::now() < deadline, "producer never settled: {producer:?}");
        producer.exchange(Duration::from_millis(5))?;
        thread::sleep(Duration::from_millis(1));
    }

    let (ids, resent, lines) = server.join().expect("server");
    assert_eq!(resent, ids[2]);
    let headers: Vec<_> = lines.iter().filter(|l| l.starts_with("TRANSACTION")).collect();
    assert_eq!(headers.len(), 1);
    assert!(headers[0].contains(&ids[2].to_string()));
    let stats = producer.stats();
    assert_eq!(stats.accepted, 3);
    assert_eq!(stats.connection_losses, 1);
    assert_eq!(stats.connects, 2);
    assert!(producer.is_settled());
    Ok(())
}
