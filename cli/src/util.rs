use serde_json::{Value, json};

pub const EXIT_OK: i32 = 0;
pub const EXIT_CLIENT_ERROR: i32 = 1;
pub const EXIT_SERVER_ERROR: i32 = 2;
pub const EXIT_CONNECTION_ERROR: i32 = 3;
pub const EXIT_USAGE_ERROR: i32 = 4;

pub fn client() -> reqwest::Client {
    reqwest::Client::new()
}

pub fn render(value: &Value, raw: bool) -> String {
    let rendered = if raw {
        serde_json::to_string(value)
    } else {
        serde_json::to_string_pretty(value)
    };
    rendered.unwrap_or_else(|_| value.to_string())
}

/// Print a structured usage error to stderr and exit with code 4.
pub fn exit_error(message: &str, docs_hint: Option<&str>) -> ! {
    let mut err = json!({
        "error": "cli_error",
        "message": message
    });
    if let Some(hint) = docs_hint {
        err["docs_hint"] = json!(hint);
    }
    eprintln!("{}", render(&err, false));
    std::process::exit(EXIT_USAGE_ERROR);
}

/// The API identifies callers by the x-user-id header, which must be a UUID.
pub fn require_user_id(user_id: Option<&str>) -> String {
    let Some(raw) = user_id.map(str::trim).filter(|id| !id.is_empty()) else {
        exit_error(
            "No user id configured",
            Some("Pass --user-id or set SHEPHERD_USER_ID"),
        );
    };
    match uuid::Uuid::parse_str(raw) {
        Ok(id) => id.to_string(),
        Err(e) => exit_error(
            &format!("Invalid user id '{raw}': {e}"),
            Some("SHEPHERD_USER_ID must be a UUID"),
        ),
    }
}

pub const fn exit_code_for_status(status: u16) -> i32 {
    match status {
        200..=299 => EXIT_OK,
        400..=499 => EXIT_CLIENT_ERROR,
        _ => EXIT_SERVER_ERROR,
    }
}

pub struct ApiCall<'a> {
    pub method: reqwest::Method,
    pub path: &'a str,
    pub user_id: Option<&'a str>,
    pub body: Option<Value>,
    pub query: Vec<(&'static str, String)>,
}

impl<'a> ApiCall<'a> {
    pub fn get(path: &'a str, user_id: Option<&'a str>) -> Self {
        Self {
            method: reqwest::Method::GET,
            path,
            user_id,
            body: None,
            query: Vec::new(),
        }
    }

    pub fn post(path: &'a str, user_id: &'a str, body: Value) -> Self {
        Self {
            method: reqwest::Method::POST,
            path,
            user_id: Some(user_id),
            body: Some(body),
            query: Vec::new(),
        }
    }

    pub fn query(mut self, key: &'static str, value: Option<impl ToString>) -> Self {
        if let Some(value) = value {
            self.query.push((key, value.to_string()));
        }
        self
    }
}

/// Execute an API request, print the response, and return a structured exit code.
///
/// Exit codes: 0=success (2xx), 1=client error (4xx), 2=server error (5xx),
///             3=connection error, 4=usage error
pub async fn api_request(api_url: &str, call: ApiCall<'_>, raw: bool) -> i32 {
    let url = match reqwest::Url::parse(&format!("{api_url}{}", call.path)) {
        Ok(mut u) => {
            if !call.query.is_empty() {
                let mut q = u.query_pairs_mut();
                for (k, v) in &call.query {
                    q.append_pair(k, v);
                }
            }
            u
        }
        Err(e) => {
            let err = json!({
                "error": "cli_error",
                "message": format!("Invalid URL: {api_url}{}: {e}", call.path)
            });
            eprintln!("{}", render(&err, raw));
            return EXIT_USAGE_ERROR;
        }
    };

    let mut req = client().request(call.method, url);
    if let Some(user_id) = call.user_id {
        req = req.header("x-user-id", user_id);
    }
    if let Some(body) = call.body {
        req = req.json(&body);
    }

    let resp = match req.send().await {
        Ok(r) => r,
        Err(e) => {
            tracing::debug!(error = %e, "request failed");
            let err = json!({
                "error": "connection_error",
                "message": format!("{e}"),
                "docs_hint": "Is the API server running? Check SHEPHERD_API_URL."
            });
            eprintln!("{}", render(&err, raw));
            return EXIT_CONNECTION_ERROR;
        }
    };

    let status = resp.status().as_u16();
    let exit_code = exit_code_for_status(status);

    let resp_body: Value = match resp.json().await {
        Ok(v) => v,
        Err(e) => json!({"raw_error": format!("Failed to parse response as JSON: {e}")}),
    };

    let formatted = render(&resp_body, raw);
    if exit_code == EXIT_OK {
        println!("{formatted}");
    } else {
        eprintln!("{formatted}");
    }

    exit_code
}
