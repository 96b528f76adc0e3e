use cloudlink::message::{Message, encode_property as encode};

/// Provisioning service API version.
pub const DPS_API_VERSION: &str = "2019-03-31";
/// Hub API version.
pub const HUB_API_VERSION: &str = "2021-04-12";
/// MQTT over TLS port.
pub const MQTT_TLS_PORT: u16 = 8883;

/// Provisioning responses subscription.
pub const DPS_RESPONSES: &str = "$dps/registrations/res/#";
const DPS_RESPONSE_PREFIX: &str = "$dps/registrations/res/";

/// Method invocations subscription.
pub const METHODS_SUBSCRIPTION: &str = "$iothub/methods/POST/#";
const METHODS_PREFIX: &str = "$iothub/methods/POST/";

/// Twin responses subscription.
pub const TWIN_RESPONSES: &str = "$iothub/twin/res/#";
const TWIN_RESPONSE_PREFIX: &str = "$iothub/twin/res/";

/// Desired properties updates subscription.
pub const TWIN_DESIRED_SUBSCRIPTION: &str = "$iothub/twin/PATCH/properties/desired/#";
const TWIN_DESIRED_PREFIX: &str = "$iothub/twin/PATCH/properties/desired/";

// Splits `<path>?<query>` and returns the value of `key` in the query.
fn query_value(topic: &str, key: &str) -> Option<String> {
    let (_, query) = topic.split_once('?')?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

/// Returns the username of a provisioning session.
#[must_use]
pub fn dps_username(scope_id: &str, registration_id: &str) -> String {
    format!("{scope_id}/registrations/{registration_id}/api-version={DPS_API_VERSION}")
}

/// Returns the registration request topic.
#[must_use]
pub fn dps_register(request_id: u32) -> String {
    format!("$dps/registrations/PUT/iotdps-register/?$rid={request_id}")
}

/// Returns the operation status request topic.
#[must_use]
pub fn dps_operation_status(request_id: u32, operation_id: &str) -> String {
    format!(
        "$dps/registrations/GET/iotdps-get-operationstatus/?$rid={request_id}&operationId={}",
        encode(operation_id)
    )
}

/// A provisioning service response topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DpsResponse {
    /// HTTP-like status.
    pub status: u16,
    /// Request identifier.
    pub request_id: Option<u32>,
    /// Seconds to wait before the next operation status request.
    pub retry_after: Option<u64>,
}

/// Parses a provisioning service response topic.
#[must_use]
pub fn parse_dps_response(topic: &str) -> Option<DpsResponse> {
    let rest = topic.strip_prefix(DPS_RESPONSE_PREFIX)?;
    let (status, _) = rest.split_once('/')?;
    Some(DpsResponse {
        status: status.parse().ok()?,
        request_id: query_value(topic, "$rid").and_then(|v| v.parse().ok()),
        retry_after: query_value(topic, "retry-after").and_then(|v| v.parse().ok()),
    })
}

/// Returns the username of a hub session.
#[must_use]
pub fn hub_username(hub_uri: &str, device_id: &str, model_id: Option<&str>) -> String {
    let mut username = format!("{hub_uri}/{device_id}/?api-version={HUB_API_VERSION}");
    if let Some(model_id) = model_id {
        username.push_str("&model-id=");
        username.push_str(&encode(model_id));
    }
    username
}

/// Returns the cloud-to-device messages subscription of a device.
#[must_use]
pub fn c2d_subscription(device_id: &str) -> String {
    format!("devices/{device_id}/messages/devicebound/#")
}

/// Returns the telemetry topic of a message.
///
/// The system properties, always percent-encoded, are followed by the
/// application properties. With `url_encode`, application keys and values
/// are percent-encoded too, otherwise they are written as given.
#[must_use]
pub fn telemetry(device_id: &str, message: &Message, url_encode: bool) -> String {
    let mut properties: Vec<String> = message
        .system_properties()
        .into_iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect();

    for (key, value) in message.properties() {
        if url_encode {
            properties.push(format!("{}={}", encode(key), encode(value)));
        } else {
            properties.push(format!("{key}={value}"));
        }
    }

    format!(
        "devices/{device_id}/messages/events/{}",
        properties.join("&")
    )
}

/// Parses the properties of a cloud-to-device message topic.
///
/// With `url_decode`, keys and values are percent-decoded. Returns `None`
/// when the topic is not a cloud-to-device topic of the device.
#[must_use]
pub fn parse_c2d(device_id: &str, topic: &str, url_decode: bool) -> Option<Vec<(String, String)>> {
    let prefix = format!("devices/{device_id}/messages/devicebound/");
    let properties = topic.strip_prefix(&prefix)?;

    if url_decode {
        return Some(
            url::form_urlencoded::parse(properties.as_bytes())
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect(),
        );
    }

    Some(
        properties
            .split('&')
            .filter(|pair| !pair.is_empty())
            .map(|pair| {
                let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                (key.to_owned(), value.to_owned())
            })
            .collect(),
    )
}

/// Parses a method invocation topic into its name and request identifier.
#[must_use]
pub fn parse_method(topic: &str) -> Option<(String, String)> {
    let rest = topic.strip_prefix(METHODS_PREFIX)?;
    let (name, _) = rest.split_once('/')?;
    if name.is_empty() {
        return None;
    }
    let request_id = query_value(topic, "$rid")?;
    Some((name.to_owned(), request_id))
}

/// Returns the method response topic.
#[must_use]
pub fn method_response(status: u16, request_id: &str) -> String {
    format!("$iothub/methods/res/{status}/?$rid={}", encode(request_id))
}

/// Returns the full twin request topic.
#[must_use]
pub fn twin_get(request_id: &str) -> String {
    format!("$iothub/twin/GET/?$rid={request_id}")
}

/// Returns the reported properties update topic.
#[must_use]
pub fn twin_reported(request_id: &str) -> String {
    format!("$iothub/twin/PATCH/properties/reported/?$rid={request_id}")
}

/// A twin topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TwinTopic {
    /// A response to a twin request.
    Response {
        /// HTTP-like status.
        status: u16,
        /// Request identifier.
        request_id: String,
    },
    /// A desired properties update.
    Desired,
}

/// Parses a twin topic.
#[must_use]
pub fn parse_twin(topic: &str) -> Option<TwinTopic> {
    if topic.starts_with(TWIN_DESIRED_PREFIX) {
        return Some(TwinTopic::Desired);
    }

    let rest = topic.strip_prefix(TWIN_RESPONSE_PREFIX)?;
    let (status, _) = rest.split_once('/')?;
    Some(TwinTopic::Response {
        status: status.parse().ok()?,
        request_id: query_value(topic, "$rid")?,
    })
}

#[cfg(test)]
mod tests {
    use cloudlink::dispatch::Dispatcher;

    use super::{
        DpsResponse, TwinTopic, dps_operation_status, dps_username, hub_username,
        method_response, parse_c2d, parse_dps_response, parse_method, parse_twin, telemetry,
    };

    #[test]
    fn dps_topics() {
        assert_eq!(
            dps_username("0ne00000001", "sensor-7"),
            "0ne00000001/registrations/sensor-7/api-version=2019-03-31"
        );
        assert_eq!(
            dps_operation_status(3, "4.a2b:c"),
            "$dps/registrations/GET/iotdps-get-operationstatus/?$rid=3&operationId=4.a2b%3Ac"
        );
        assert_eq!(
            parse_dps_response("$dps/registrations/res/202/?$rid=1&retry-after=3"),
            Some(DpsResponse {
                status: 202,
                request_id: Some(1),
                retry_after: Some(3),
            })
        );
        assert_eq!(
            parse_dps_response("$dps/registrations/res/200/?$rid=2"),
            Some(DpsResponse {
                status: 200,
                request_id: Some(2),
                retry_after: None,
            })
        );
        assert_eq!(parse_dps_response("devices/x/messages/devicebound/"), None);
    }

    #[test]
    fn hub_username_with_model() {
        assert_eq!(
            hub_username("my-hub.example.net", "sensor-7", Some("dtmi:example:device;1")),
            "my-hub.example.net/sensor-7/?api-version=2021-04-12&model-id=dtmi%3Aexample%3Adevice%3B1"
        );
        assert_eq!(
            hub_username("my-hub.example.net", "sensor-7", None),
            "my-hub.example.net/sensor-7/?api-version=2021-04-12"
        );
    }

    #[test]
    fn telemetry_topic() {
        let mut dispatcher = Dispatcher::new();
        let message = dispatcher
            .build_message("hello", Some("text/plain"), Some("utf-8"))
            .subject("thermostat1")
            .property("alert level", "high/2");

        assert_eq!(
            telemetry("sensor-7", &message, true),
            format!(
                "devices/sensor-7/messages/events/$.mid={}&$.ct=text%2Fplain&$.ce=utf-8&$.sub=thermostat1&alert%20level=high%2F2",
                message.id()
            )
        );
        assert!(telemetry("sensor-7", &message, false).ends_with("&alert level=high/2"));
    }

    #[test]
    fn telemetry_reserved_characters() {
        let mut dispatcher = Dispatcher::new();
        let message = dispatcher
            .build_message("hi", None, Some("utf-8&x=1/2"))
            .subject("a&$.ct=evil/1");

        for url_encode in [true, false] {
            let topic = telemetry("sensor-7", &message, url_encode);
            assert_eq!(
                topic,
                format!(
                    "devices/sensor-7/messages/events/$.mid={}&$.ce=utf-8%26x%3D1%2F2&$.sub=a%26%24.ct%3Devil%2F1",
                    message.id()
                )
            );

            // No content type appears, and the values decode back.
            let properties = parse_c2d(
                "sensor-7",
                &topic.replace("/messages/events/", "/messages/devicebound/"),
                true,
            )
            .unwrap();
            assert_eq!(
                properties,
                [
                    ("$.mid".to_owned(), message.id().to_string()),
                    ("$.ce".to_owned(), "utf-8&x=1/2".to_owned()),
                    ("$.sub".to_owned(), "a&$.ct=evil/1".to_owned()),
                ]
            );
        }
    }

    #[test]
    fn telemetry_application_properties() {
        let mut dispatcher = Dispatcher::new();
        let message = dispatcher
            .build_message("hi", None, None)
            .property("a&b", "c=d")
            .property("50%", "x y");

        let id = message.id();
        assert_eq!(
            telemetry("sensor-7", &message, true),
            format!("devices/sensor-7/messages/events/$.mid={id}&a%26b=c%3Dd&50%25=x%20y")
        );
        // Without encoding, keys and values are the caller's responsibility.
        assert_eq!(
            telemetry("sensor-7", &message, false),
            format!("devices/sensor-7/messages/events/$.mid={id}&a&b=c=d&50%=x y")
        );
    }

    #[test]
    fn c2d_properties() {
        assert_eq!(
            parse_c2d(
                "sensor-7",
                "devices/sensor-7/messages/devicebound/%24.mid=9&%24.to=%2Fdevices%2Fsensor-7&led=on",
                true
            ),
            Some(vec![
                ("$.mid".to_owned(), "9".to_owned()),
                ("$.to".to_owned(), "/devices/sensor-7".to_owned()),
                ("led".to_owned(), "on".to_owned()),
            ])
        );
        assert_eq!(
            parse_c2d("sensor-7", "devices/sensor-7/messages/devicebound/a%2Fb=1&flag", false),
            Some(vec![
                ("a%2Fb".to_owned(), "1".to_owned()),
                ("flag".to_owned(), String::new()),
            ])
        );
        assert_eq!(
            parse_c2d("sensor-7", "devices/other/messages/devicebound/", true),
            None
        );
    }

    #[test]
    fn method_topics() {
        assert_eq!(
            parse_method("$iothub/methods/POST/reboot/?$rid=1f"),
            Some(("reboot".to_owned(), "1f".to_owned()))
        );
        assert_eq!(parse_method("$iothub/methods/POST//?$rid=1"), None);
        assert_eq!(parse_method("$iothub/methods/POST/reboot/"), None);
        assert_eq!(method_response(404, "1f"), "$iothub/methods/res/404/?$rid=1f");
    }

    #[test]
    fn twin_topics() {
        assert_eq!(
            parse_twin("$iothub/twin/res/204/?$rid=3&$version=5"),
            Some(TwinTopic::Response {
                status: 204,
                request_id: "3".to_owned(),
            })
        );
        assert_eq!(
            parse_twin("$iothub/twin/PATCH/properties/desired/?$version=6"),
            Some(TwinTopic::Desired)
        );
        assert_eq!(parse_twin("$iothub/methods/POST/x/?$rid=1"), None);
    }
}
