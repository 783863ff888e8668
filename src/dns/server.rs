//! UDP server answering A queries from the peer cache

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::Builder;

use derive_more::{Display, Error, From};
use hickory_resolver::proto::op::{Message, MessageType, ResponseCode};
use hickory_resolver::proto::rr::rdata::A;
use hickory_resolver::proto::rr::{RData, Record, RecordType};
use parking_lot::{Condvar, Mutex};

use crate::dns::client::Resolution;
use crate::dns::context::ServerContext;

/// TTL put on answer records
pub const ANSWER_TTL: u32 = 60;

/// Largest datagram read from the socket
const MAX_DATAGRAM: usize = 4096;

#[derive(Debug, Display, From, Error)]
pub enum ServerError {
    Io(std::io::Error),
}

type Result<T> = std::result::Result<T, ServerError>;

macro_rules! return_or_report {
    ( $x:expr, $message:expr ) => {
        match $x {
            Ok(res) => res,
            Err(e) => {
                log::info!("{}: {}", $message, e);
                return;
            }
        }
    };
}

/// Common trait for DNS servers
pub trait DnsServer {
    /// Bind and start serving.
    ///
    /// This method should _NOT_ block. Servers are expected to spawn threads to
    /// handle requests and return immediately.
    fn run_server(self) -> Result<()>;
}

fn build_response(request: &Message) -> Message {
    let mut response = Message::new();
    response
        .set_id(request.id())
        .set_message_type(MessageType::Response)
        .set_op_code(request.op_code())
        .set_recursion_desired(request.recursion_desired())
        .set_recursion_available(true);
    response.add_queries(request.queries().iter().cloned());

    response
}

/// Answers a parsed request.
///
/// Only the first question is resolved. A queries go through the entry client
/// of the context; any resolution failure becomes SERVFAIL.
pub fn execute_query(context: &ServerContext, request: &Message) -> Message {
    let mut response = build_response(request);

    let question = match request.queries().first() {
        Some(question) => question,
        None => {
            log::info!("FORMERR: request {} has no question", request.id());
            response.set_response_code(ResponseCode::FormErr);
            return response;
        }
    };

    if question.query_type() != RecordType::A {
        log::info!("NOTIMP: {} {}", question.query_type(), question.name());
        response.set_response_code(ResponseCode::NotImp);
        return response;
    }

    let domain = question.name().to_ascii();
    match context.resolve(&domain) {
        Ok(Resolution {
            address: IpAddr::V4(addr),
            source,
        }) => {
            log::info!("{} resolved to {} from {}", domain, addr, source);

            response.add_answer(Record::from_rdata(
                question.name().clone(),
                ANSWER_TTL,
                RData::A(A(addr)),
            ));
            response.set_response_code(ResponseCode::NoError);
        }
        Ok(Resolution { address, .. }) => {
            // Never answer an A question with another record type
            log::warn!("SERVFAIL for {}: cached address {} is not IPv4", domain, address);
            response.set_response_code(ResponseCode::ServFail);
        }
        Err(e) => {
            log::info!("SERVFAIL for {}: {}", domain, e);
            response.set_response_code(ResponseCode::ServFail);
        }
    }

    response
}

/// Decodes a datagram, answers it and encodes the reply. Undecodable
/// datagrams get no reply.
pub fn handle_datagram(context: &ServerContext, data: &[u8]) -> Option<Vec<u8>> {
    let request = match Message::from_vec(data) {
        Ok(request) => request,
        Err(e) => {
            log::info!("Failed to parse UDP query packet: {}", e);
            return None;
        }
    };

    match execute_query(context, &request).to_vec() {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            log::info!("Failed to encode response for {}: {}", request.id(), e);
            None
        }
    }
}

/// The UDP server
///
/// One thread reads datagrams off the socket and queues them; a pool of
/// worker threads takes them off the queue, resolves them and replies.
pub struct DnsUdpServer {
    context: Arc<ServerContext>,
    request_queue: Arc<Mutex<VecDeque<(SocketAddr, Vec<u8>)>>>,
    request_cond: Arc<Condvar>,
    thread_count: usize,
}

impl DnsUdpServer {
    pub fn new(context: Arc<ServerContext>, thread_count: usize) -> DnsUdpServer {
        DnsUdpServer {
            context,
            request_queue: Arc::new(Mutex::new(VecDeque::new())),
            request_cond: Arc::new(Condvar::new()),
            thread_count: thread_count.max(1),
        }
    }

    fn process_request(socket: &UdpSocket, context: &ServerContext, src: SocketAddr, data: &[u8]) {
        let reply = match handle_datagram(context, data) {
            Some(reply) => reply,
            None => return,
        };

        return_or_report!(
            socket.send_to(&reply, src),
            "Failed to send response packet"
        );
    }

    fn spawn_request_handler(&self, thread_id: usize, socket: UdpSocket) -> std::io::Result<()> {
        let context = self.context.clone();
        let request_cond = self.request_cond.clone();
        let request_queue = self.request_queue.clone();

        Builder::new()
            .name(format!("DnsUdpServer-request-{}", thread_id))
            .spawn(move || loop {
                let (src, data) = {
                    let mut queue = request_queue.lock();
                    loop {
                        if let Some(request) = queue.pop_front() {
                            break request;
                        }
                        request_cond.wait(&mut queue);
                    }
                };

                Self::process_request(&socket, &context, src, &data);
            })?;

        Ok(())
    }

    fn spawn_incoming_handler(self, socket: UdpSocket) -> std::io::Result<()> {
        Builder::new()
            .name("DnsUdpServer-incoming".into())
            .spawn(move || {
                let mut buf = [0u8; MAX_DATAGRAM];
                loop {
                    let (len, src) = match socket.recv_from(&mut buf) {
                        Ok(x) => x,
                        Err(e) => {
                            log::info!("Failed to read from UDP socket: {:?}", e);
                            continue;
                        }
                    };

                    self.context
                        .statistics
                        .udp_query_count
                        .fetch_add(1, Ordering::Release);

                    self.request_queue.lock().push_back((src, buf[..len].to_vec()));
                    self.request_cond.notify_one();
                }
            })?;

        Ok(())
    }
}

impl DnsServer for DnsUdpServer {
    fn run_server(self) -> Result<()> {
        let socket = UdpSocket::bind(self.context.listen)?;
        log::info!("Listening for UDP queries on {}", socket.local_addr()?);

        for thread_id in 0..self.thread_count {
            self.spawn_request_handler(thread_id, socket.try_clone()?)?;
        }

        self.spawn_incoming_handler(socket)?;

        Ok(())
    }
}
