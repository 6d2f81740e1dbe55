//! In-process KLAP device for unit tests.
//!
//! Implements the device side of both handshake rounds and the encrypted
//! request endpoint on top of [`HttpTransport`], with switches to inject the
//! failures the client has to cope with.

use std::{collections::HashMap, sync::Mutex, time::Duration};

use async_trait::async_trait;

use crate::{
    credentials::AuthSecret,
    crypto::klap::{SEED_LEN, SessionKeys, handshake1_server_proof, handshake2_client_proof},
    error::Error,
    transport::{
        HANDSHAKE1_PATH, HANDSHAKE2_PATH, HttpRequest, HttpResponse, HttpTransport, REQUEST_PATH,
        SEQ_PARAM, SESSION_COOKIE_NAME, SessionCookies,
    },
};

/// Prefix the device puts in front of every echoed request.
pub(crate) const REPLY_PREFIX: &[u8] = b"ok:";

/// Failure switches; all off by default.
#[derive(Debug, Default, Clone)]
pub(crate) struct Behavior {
    pub handshake1_status: Option<u16>,
    pub handshake1_body_len: Option<usize>,
    pub bad_server_proof: bool,
    pub reject_handshake2: bool,
    pub request_status: Option<u16>,
    pub corrupt_responses: bool,
    pub request_delay: Option<Duration>,
}

#[derive(Default)]
struct DeviceState {
    next_session: u8,
    pending: HashMap<String, ([u8; SEED_LEN], [u8; SEED_LEN])>,
    sessions: HashMap<String, SessionKeys>,
    handshake1_count: usize,
    handshake1_bodies: Vec<Vec<u8>>,
    handshake2_count: usize,
    request_seqs: Vec<i32>,
    received_bodies: Vec<Vec<u8>>,
}

pub(crate) struct SimulatedDevice {
    auth: AuthSecret,
    behavior: Mutex<Behavior>,
    state: Mutex<DeviceState>,
}

impl SimulatedDevice {
    pub fn new(auth: AuthSecret) -> Self {
        Self {
            auth,
            behavior: Mutex::new(Behavior::default()),
            state: Mutex::new(DeviceState::default()),
        }
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn handshake1_count(&self) -> usize {
        self.state.lock().unwrap().handshake1_count
    }

    /// Local seeds posted to `/app/handshake1`, in arrival order.
    pub fn handshake1_bodies(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().handshake1_bodies.clone()
    }

    pub fn handshake2_count(&self) -> usize {
        self.state.lock().unwrap().handshake2_count
    }

    pub fn request_seqs(&self) -> Vec<i32> {
        self.state.lock().unwrap().request_seqs.clone()
    }

    pub fn received_bodies(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().received_bodies.clone()
    }

    fn handshake1(&self, request: &HttpRequest<'_>, cookies: &mut SessionCookies) -> HttpResponse {
        let behavior = self.behavior.lock().unwrap().clone();
        let mut state = self.state.lock().unwrap();
        state.handshake1_count += 1;
        state.handshake1_bodies.push(request.body.to_vec());

        if let Some(status) = behavior.handshake1_status {
            return HttpResponse::new(status, Vec::new());
        }
        let Ok(local_seed) = <[u8; SEED_LEN]>::try_from(request.body) else {
            return HttpResponse::new(400, Vec::new());
        };

        state.next_session = state.next_session.wrapping_add(1);
        let remote_seed = [0x10u8.wrapping_add(state.next_session); SEED_LEN];
        let session_id = format!("SIM{:04}", state.next_session);
        state
            .pending
            .insert(session_id.clone(), (local_seed, remote_seed));

        cookies.set(SESSION_COOKIE_NAME, session_id);
        cookies.set("TIMEOUT", "86400");

        let mut proof = handshake1_server_proof(&local_seed, &remote_seed, &self.auth);
        if behavior.bad_server_proof {
            proof[0] ^= 0xff;
        }

        let mut body = remote_seed.to_vec();
        body.extend_from_slice(&proof);
        if let Some(len) = behavior.handshake1_body_len {
            body.resize(len, 0);
        }
        HttpResponse::new(200, body)
    }

    fn handshake2(&self, request: &HttpRequest<'_>, cookies: &SessionCookies) -> HttpResponse {
        let behavior = self.behavior.lock().unwrap().clone();
        let mut state = self.state.lock().unwrap();
        state.handshake2_count += 1;

        let Some(session_id) = cookies.get(SESSION_COOKIE_NAME).map(str::to_string) else {
            return HttpResponse::new(403, Vec::new());
        };
        let Some((local_seed, remote_seed)) = state.pending.remove(&session_id) else {
            return HttpResponse::new(403, Vec::new());
        };

        let expected = handshake2_client_proof(&local_seed, &remote_seed, &self.auth);
        if behavior.reject_handshake2 || request.body != expected {
            return HttpResponse::new(403, Vec::new());
        }

        state.sessions.insert(
            session_id,
            SessionKeys::derive(&local_seed, &remote_seed, &self.auth),
        );
        HttpResponse::new(200, Vec::new())
    }

    fn request(&self, request: &HttpRequest<'_>, cookies: &SessionCookies) -> HttpResponse {
        let behavior = self.behavior.lock().unwrap().clone();
        let mut state = self.state.lock().unwrap();

        let Some(seq) = request
            .query_param(SEQ_PARAM)
            .and_then(|s| s.parse::<i32>().ok())
        else {
            return HttpResponse::new(400, Vec::new());
        };
        state.request_seqs.push(seq);
        state.received_bodies.push(request.body.to_vec());

        if let Some(status) = behavior.request_status {
            return HttpResponse::new(status, Vec::new());
        }

        let Some(keys) = cookies
            .get(SESSION_COOKIE_NAME)
            .and_then(|id| state.sessions.get(id))
        else {
            return HttpResponse::new(403, Vec::new());
        };

        let Ok(plaintext) = keys.open(seq, request.body, true) else {
            return HttpResponse::new(400, Vec::new());
        };

        let mut reply = REPLY_PREFIX.to_vec();
        reply.extend_from_slice(&plaintext);
        let mut body = keys.seal(seq, &reply);
        if behavior.corrupt_responses {
            body[0] ^= 0xff;
        }
        HttpResponse::new(200, body)
    }
}

#[async_trait]
impl HttpTransport for SimulatedDevice {
    async fn post(
        &self,
        request: HttpRequest<'_>,
        cookies: &mut SessionCookies,
    ) -> Result<HttpResponse, Error> {
        match request.path {
            HANDSHAKE1_PATH => Ok(self.handshake1(&request, cookies)),
            HANDSHAKE2_PATH => Ok(self.handshake2(&request, cookies)),
            REQUEST_PATH => {
                let delay = self.behavior.lock().unwrap().request_delay;
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                Ok(self.request(&request, cookies))
            }
            _ => Ok(HttpResponse::new(404, Vec::new())),
        }
    }
}
