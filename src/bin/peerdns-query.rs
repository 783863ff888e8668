//! Interactive client for trying out a running peerdns server

use std::env;
use std::io::{self, BufRead, Write};
use std::net::{SocketAddr, UdpSocket};
use std::str::FromStr;
use std::time::Duration;

use getopts::Options;
use hickory_resolver::proto::op::{Message, MessageType, OpCode, Query};
use hickory_resolver::proto::rr::{Name, RData, RecordType};

const DEFAULT_SERVER: &str = "127.0.0.1:8053";

fn print_usage(program: &str, opts: Options) {
    let brief = format!("Usage: {} [options]", program);
    print!("{}", opts.usage(&brief));
}

fn query(socket: &UdpSocket, server: SocketAddr, id: u16, domain: &str) -> io::Result<Message> {
    let name = Name::from_str(domain)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;

    let mut request = Message::new();
    request
        .set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true);
    request.add_query(Query::query(name, RecordType::A));

    let bytes = request
        .to_vec()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    socket.send_to(&bytes, server)?;

    let mut buf = [0u8; 4096];
    let (len, _) = socket.recv_from(&mut buf)?;

    Message::from_vec(&buf[..len]).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
}

fn main() {
    let args: Vec<String> = env::args().collect();
    let program = args[0].clone();

    let mut opts = Options::new();
    opts.optflag("h", "help", "print this help menu");
    opts.optopt(
        "s",
        "server",
        "Server to query (default: 127.0.0.1:8053)",
        "ADDR",
    );

    let opt_matches = match opts.parse(&args[1..]) {
        Ok(m) => m,
        Err(f) => {
            eprintln!("{}", f);
            std::process::exit(2);
        }
    };

    if opt_matches.opt_present("h") {
        print_usage(&program, opts);
        return;
    }

    let server_str = opt_matches
        .opt_str("s")
        .unwrap_or_else(|| DEFAULT_SERVER.to_string());
    let server: SocketAddr = match server_str.parse() {
        Ok(addr) => addr,
        Err(_) => {
            eprintln!("Invalid server address: {}", server_str);
            std::process::exit(2);
        }
    };

    let socket = match UdpSocket::bind("0.0.0.0:0")
        .and_then(|s| s.set_read_timeout(Some(Duration::from_secs(5))).map(|_| s))
    {
        Ok(socket) => socket,
        Err(e) => {
            eprintln!("Failed to open UDP socket: {}", e);
            std::process::exit(1);
        }
    };

    let stdin = io::stdin();
    let mut id: u16 = 1;

    loop {
        print!("Enter domain name: ");
        let _ = io::stdout().flush();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                eprintln!("Failed to read input: {}", e);
                break;
            }
        }

        let domain = line.trim();
        if domain.is_empty() {
            continue;
        }

        id = id.wrapping_add(1);
        let response = match query(&socket, server, id, domain) {
            Ok(response) => response,
            Err(e) => {
                println!("Failed to get DNS response: {}", e);
                continue;
            }
        };

        let address = response.answers().iter().find_map(|record| match record.data() {
            Some(RData::A(a)) => Some(a.0.to_string()),
            Some(RData::AAAA(aaaa)) => Some(aaaa.0.to_string()),
            _ => None,
        });

        match address {
            Some(address) => println!("IP address for {}: {}", domain, address),
            None => println!(
                "No IP address found for {} ({:?})",
                domain,
                response.response_code()
            ),
        }
    }
}
