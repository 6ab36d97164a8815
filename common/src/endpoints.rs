pub const PATH_SHOULD_REMAIN_AWAKE: &str = "/should-remain-awake";
pub const PATH_REGISTER: &str = "/register";
pub const PATH_WIFI_FAILURES: &str = "/wifi-failures";

pub const HEADER_SERVER_TIME: &str = "X-Server-Time";

pub const PORTAL_INDEX: &str = "/";
pub const PORTAL_IS_UP: &str = "/is-up";
pub const PORTAL_CONFIGURE: &str = "/configure";
pub const PORTAL_CURRENT_CONFIG: &str = "/currentConfig";
pub const PORTAL_SET_MODE: &str = "/setMode";
pub const PORTAL_REPORT: &str = "/report";
pub const PORTAL_OUTPUT_ON: &str = "/output-on";
pub const PORTAL_OUTPUT_OFF: &str = "/output-off";

pub fn endpoint_url(server_url: &str, path: &str) -> String {
    format!("{}{}", server_url.trim_end_matches('/'), path)
}

pub fn directive_url(server_url: &str, serial_number: &str) -> String {
    format!(
        "{}?id={}",
        endpoint_url(server_url, PATH_SHOULD_REMAIN_AWAKE),
        serial_number
    )
}
