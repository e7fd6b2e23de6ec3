use std::time::Duration;

use actix_rt::SystemRunner;
use awc::http::Method;

use crate::error::GatewayError;

/// Outbound webhook capability used by the trigger dispatcher.
pub trait Deliver {
    /// Sends `body` to `url` and returns the response status. Anything other
    /// than a 2xx status is an error.
    fn deliver(&mut self, method: &str, url: &str, body: String) -> Result<u16, GatewayError>;
}

/// Blocking webhook client for the dispatcher thread.
///
/// Owns a private actix system so each request can be driven to completion
/// synchronously; the dispatcher does not wait on anything else meanwhile.
/// Requests are built inside the system since awc arms its timeout timer
/// as soon as a request is sent.
pub struct WebhookClient {
    system: SystemRunner,
    client: awc::Client,
}

impl WebhookClient {
    pub fn new(timeout: Duration) -> Self {
        let system = actix_rt::System::new();
        let client = system.block_on(async move { awc::Client::builder().timeout(timeout).finish() });
        Self { system, client }
    }
}

impl Deliver for WebhookClient {
    fn deliver(&mut self, method: &str, url: &str, body: String) -> Result<u16, GatewayError> {
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|e| GatewayError::Delivery(format!("bad method {method:?}: {e}")))?;
        let client = &self.client;
        let request_method = method.clone();
        let response = self
            .system
            .block_on(async move { client.request(request_method, url).send_body(body).await })
            .map_err(|e| GatewayError::Delivery(format!("{method} {url}: {e}")))?;

        let status = response.status();
        if status.is_success() {
            Ok(status.as_u16())
        } else {
            Err(GatewayError::Delivery(format!("{method} {url}: {status}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::thread::{self, JoinHandle};

    use super::*;

    /// Answers one request with `status` and hands back the request line and body.
    fn one_shot_server(status: &'static str) -> (String, JoinHandle<(String, String)>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/hook", listener.local_addr().unwrap());

        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());

            let mut request_line = String::new();
            reader.read_line(&mut request_line).unwrap();
            let mut content_length = 0;
            loop {
                let mut header = String::new();
                reader.read_line(&mut header).unwrap();
                let header = header.trim_end();
                if header.is_empty() {
                    break;
                }
                if let Some((name, value)) = header.split_once(':')
                    && name.eq_ignore_ascii_case("content-length")
                {
                    content_length = value.trim().parse().unwrap();
                }
            }
            let mut body = vec![0u8; content_length];
            reader.read_exact(&mut body).unwrap();

            let mut stream = stream;
            write!(
                stream,
                "HTTP/1.1 {status}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
            )
            .unwrap();
            stream.flush().unwrap();

            (
                request_line.trim_end().to_string(),
                String::from_utf8(body).unwrap(),
            )
        });
        (url, server)
    }

    #[test]
    fn success_status_is_returned() {
        let (url, server) = one_shot_server("200 OK");
        let mut client = WebhookClient::new(Duration::from_secs(5));

        let status = client.deliver("PUT", &url, "1".to_string()).unwrap();
        assert_eq!(status, 200);

        let (request_line, body) = server.join().unwrap();
        assert_eq!(request_line, "PUT /hook HTTP/1.1");
        assert_eq!(body, "1");
    }

    #[test]
    fn error_status_is_a_delivery_error() {
        let (url, server) = one_shot_server("503 Service Unavailable");
        let mut client = WebhookClient::new(Duration::from_secs(5));

        let err = client.deliver("POST", &url, "0".to_string()).unwrap_err();
        assert!(matches!(err, GatewayError::Delivery(ref m) if m.contains("503")), "{err}");
        server.join().unwrap();
    }

    #[test]
    fn unreachable_destination_is_a_delivery_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/hook", listener.local_addr().unwrap());
        drop(listener);

        let mut client = WebhookClient::new(Duration::from_secs(5));
        assert!(matches!(
            client.deliver("PUT", &url, String::new()),
            Err(GatewayError::Delivery(_))
        ));
    }

    #[test]
    fn bad_method_is_rejected_before_sending() {
        let mut client = WebhookClient::new(Duration::from_secs(5));
        assert!(matches!(
            client.deliver("GE T", "http://127.0.0.1:1/", String::new()),
            Err(GatewayError::Delivery(_))
        ));
    }
}
