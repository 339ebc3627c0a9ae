//! Bare-bones HTML. The real console is a separate presentation layer.

use tgs_core::access::PASSWORD_PARAM;

pub fn password_prompt(title: &str, error: Option<&str>) -> String {
    let error = error
        .map(|e| format!("<p class=\"error\">{}</p>", escape(e)))
        .unwrap_or_default();
    format!(
        "<!doctype html>\n<html><head><meta charset=\"utf-8\"><title>{title}</title></head>\
         <body><h1>{title}</h1>{error}\
         <form method=\"post\" action=\"/pwd\">\
         <input type=\"password\" name=\"{PASSWORD_PARAM}\" placeholder=\"password\" autofocus>\
         <button type=\"submit\">Enter</button></form></body></html>\n",
        title = escape(title),
    )
}

pub fn upload_page(configured: bool) -> String {
    let notice = if configured {
        ""
    } else {
        "<p class=\"error\">Bot token and channel are not configured yet.</p>"
    };
    format!(
        "<!doctype html>\n<html><head><meta charset=\"utf-8\"><title>tgState</title></head>\
         <body><h1>tgState</h1>{notice}\
         <form method=\"post\" action=\"/api\" enctype=\"multipart/form-data\">\
         <input type=\"file\" name=\"image\"><button type=\"submit\">Upload</button>\
         </form></body></html>\n"
    )
}

pub fn console_page() -> String {
    "<!doctype html>\n<html><head><meta charset=\"utf-8\"><title>tgState supervisor</title></head>\
     <body><h1>tgState supervisor</h1>\
     <p>Management API under <code>/api/management/</code>.</p></body></html>\n"
        .to_string()
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
