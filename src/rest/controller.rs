//! Request handlers of the REST API.
//!
//! Each handler runs one [`Tuhi`] operation and turns its outcome into a [`Response`]. Errors
//! reported by the daemon become `500` responses.

use serde::Serialize;

use super::{ApiResponse, Tuhi};
use crate::Result;

/// An HTTP status code and a JSON body.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub body: serde_json::Value,
}

impl Response {
    fn json(status: u16, body: &impl Serialize) -> Self {
        match serde_json::to_value(body) {
            Ok(body) => Self { status, body },
            Err(e) => Self::failure(&e),
        }
    }

    fn api(code: u16, message: impl Into<String>) -> Self {
        Self::json(code, &ApiResponse::new(code, message))
    }

    fn failure(e: &dyn std::error::Error) -> Self {
        log::error!("request failed: {}", e);
        let body = serde_json::to_value(ApiResponse::new(500, e.to_string()))
            .unwrap_or_else(|_| {
                serde_json::json!({ "code": 500, "type": "error", "message": "internal error" })
            });
        Self { status: 500, body }
    }

    fn from_result<T>(result: Result<T>, ok: impl FnOnce(T) -> Self) -> Self {
        match result {
            Ok(value) => ok(value),
            Err(e) => Self::failure(&e),
        }
    }
}

/// `GET /devices`
pub fn list_devices(tuhi: &Tuhi) -> Response {
    Response::from_result(tuhi.list_devices(), |views| Response::json(200, &views))
}

/// `GET /devices/{id}`
pub fn get_device_by_id(tuhi: &Tuhi, id: &str) -> Response {
    Response::from_result(tuhi.device(id), |view| match view {
        Some(view) => Response::json(200, &view),
        None => Response::api(404, format!("no device {}", id)),
    })
}

/// `GET /search`
pub fn search(tuhi: &Tuhi) -> Response {
    Response::from_result(tuhi.search_unregistered(), |views| {
        Response::json(200, &views)
    })
}

/// `POST /register/{id}`
pub fn register_device(tuhi: &Tuhi, id: &str) -> Response {
    Response::from_result(tuhi.register(id), |registered| {
        if registered {
            Response::api(200, "success")
        } else {
            Response::api(400, format!("no unregistered device {}", id))
        }
    })
}

/// `POST /devices/{id}/listen`
pub fn toggle_listen(tuhi: &Tuhi, id: &str, listen: bool) -> Response {
    Response::from_result(tuhi.toggle_listening(id, listen), |listening| {
        match listening {
            Some(listening) => Response::api(200, format!("listening: {}", listening)),
            None => Response::api(404, format!("no device {}", id)),
        }
    })
}

#[cfg(test)]
mod tests {
    use zbus::zvariant::ObjectPath;

    use super::*;
    use crate::{
        config::Settings,
        event_loop::{EventLoop, LoopHandle},
        transport::fake::{value, FakeDaemon},
        MANAGER_INTERFACE, ROOT_PATH,
    };

    struct Fixture {
        handle: LoopHandle,
        daemon: FakeDaemon,
        tuhi: Tuhi,
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            self.handle.quit();
        }
    }

    fn fixture() -> Fixture {
        let (handle, _thread) = EventLoop::spawn().unwrap();
        let daemon = FakeDaemon::new(handle.clone());
        daemon.add_registered_device("/d1", "aa:bb:cc:dd:ee:ff", "Bamboo Spark");
        daemon.add_device("/d2", "11:22:33:44:55:66", "Bamboo Slate");
        let tuhi = Tuhi::with_session(&daemon.session(), handle.clone(), Settings::default())
            .unwrap();
        Fixture {
            handle,
            daemon,
            tuhi,
        }
    }

    #[test]
    fn device_bodies() {
        let f = fixture();

        let res = list_devices(&f.tuhi);
        assert_eq!(res.status, 200);
        assert_eq!(
            res.body,
            serde_json::json!([{
                "id": "AA:BB:CC:DD:EE:FF",
                "name": "Bamboo Spark",
                "width": 0,
                "height": 0,
                "battery": 0,
                "battery_state": 0,
                "is_listening": false,
                "is_in_live_mode": false,
                "drawings": [],
            }])
        );

        let res = get_device_by_id(&f.tuhi, "aa:bb:cc:dd:ee:ff");
        assert_eq!(res.status, 200);
        assert_eq!(res.body["id"], "AA:BB:CC:DD:EE:FF");

        let res = get_device_by_id(&f.tuhi, "11:22:33:44:55:66");
        assert_eq!(res.status, 404);
        assert_eq!(res.body["type"], "error");
    }

    #[test]
    fn search_lists_identity_only() {
        let f = fixture();
        f.daemon.emit_signal(
            ROOT_PATH,
            MANAGER_INTERFACE,
            "UnregisteredDevice",
            vec![value(ObjectPath::try_from("/d2").unwrap())],
        );
        f.handle.sync();

        let res = search(&f.tuhi);
        assert_eq!(res.status, 200);
        assert_eq!(
            res.body,
            serde_json::json!([{ "id": "11:22:33:44:55:66", "name": "Bamboo Slate" }])
        );
    }

    #[test]
    fn register_status() {
        let f = fixture();
        assert_eq!(register_device(&f.tuhi, "11:22:33:44:55:66").status, 400);

        f.daemon.emit_signal(
            ROOT_PATH,
            MANAGER_INTERFACE,
            "UnregisteredDevice",
            vec![value(ObjectPath::try_from("/d2").unwrap())],
        );
        f.handle.sync();

        let res = register_device(&f.tuhi, "11:22:33:44:55:66");
        assert_eq!(res.status, 200);
        assert_eq!(
            res.body,
            serde_json::json!({ "code": 200, "type": "success", "message": "success" })
        );
    }

    #[test]
    fn toggle_listen_status() {
        let f = fixture();
        let res = toggle_listen(&f.tuhi, "aa:bb:cc:dd:ee:ff", true);
        assert_eq!(res.status, 200);
        assert_eq!(res.body["message"], "listening: true");

        assert_eq!(toggle_listen(&f.tuhi, "11:22:33:44:55:66", true).status, 404);
    }

    #[test]
    fn daemon_errors_are_500() {
        let f = fixture();
        f.daemon.fail("StartListening", "org.freedesktop.DBus.Error.AccessDenied");

        let res = toggle_listen(&f.tuhi, "aa:bb:cc:dd:ee:ff", true);
        assert_eq!(res.status, 500);
        assert_eq!(res.body["code"], 500);
        assert_eq!(res.body["type"], "error");
        let message = res.body["message"].as_str().unwrap();
        assert!(message.contains("AccessDenied"), "{}", message);
        assert_eq!(
            res.body.as_object().map(|body| body.len()),
            Some(3),
            "{}",
            res.body
        );
    }
}
