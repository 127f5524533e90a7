//! OTP email rendering with Handlebars.

use crate::error::{DeliveryError, OtpResult};
use crate::models::OtpEmailData;
use handlebars::Handlebars;
use tracing::debug;

const OTP_SUBJECT: &str = "Verification Code - Action Required";

const OTP_HTML_TEMPLATE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="utf-8">
    <title>Your Verification Code</title>
</head>
<body style="font-family: Arial, sans-serif; line-height: 1.6; color: #333; max-width: 600px; margin: 0 auto;">
    <h1 style="color: #16a34a;">Verification Code</h1>
    <p>Hello {{user_name}},</p>
    <p>Use the code below to complete your verification:</p>
    <div style="border: 2px dashed #16a34a; border-radius: 8px; padding: 20px; text-align: center;">
        <div style="font-size: 32px; font-weight: bold; letter-spacing: 8px; font-family: monospace;">{{otp_code}}</div>
        <p style="color: #6b7280; font-size: 14px;">This code expires in <strong>{{expiry_minutes}} minutes</strong>.</p>
    </div>
    <p style="color: #6b7280; font-size: 14px;">Never share this code. If you did not request it, ignore this email.</p>
</body>
</html>"#;

/// Rendered email content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedEmail {
    pub subject: String,
    pub html: String,
}

/// Template engine for the OTP email.
pub struct OtpTemplates {
    handlebars: Handlebars<'static>,
}

impl OtpTemplates {
    pub fn new() -> OtpResult<Self> {
        let mut handlebars = Handlebars::new();
        // A missing field is a bug, not an empty string
        handlebars.set_strict_mode(true);
        handlebars.register_template_string("otp_html", OTP_HTML_TEMPLATE)?;

        Ok(Self { handlebars })
    }

    pub fn render_otp(&self, data: &OtpEmailData) -> Result<RenderedEmail, DeliveryError> {
        debug!(user = %data.user_name, "Rendering OTP email");

        let html = self
            .handlebars
            .render("otp_html", data)
            .map_err(|e| DeliveryError::Template(e.to_string()))?;

        Ok(RenderedEmail {
            subject: OTP_SUBJECT.to_string(),
            html,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data() -> OtpEmailData {
        OtpEmailData {
            user_name: "user@example.com".into(),
            otp_code: "482913".into(),
            expiry_minutes: 15,
        }
    }

    #[test]
    fn test_render_otp_email() {
        let rendered = OtpTemplates::new().unwrap().render_otp(&data()).unwrap();

        assert_eq!(rendered.subject, OTP_SUBJECT);
        assert!(rendered.html.contains("482913"));
        assert!(rendered.html.contains("15 minutes"));
        assert!(rendered.html.contains("Hello user@example.com"));
    }

    #[test]
    fn test_render_escapes_html() {
        let mut data = data();
        data.user_name = "<script>x</script>@example.com".into();

        let rendered = OtpTemplates::new().unwrap().render_otp(&data).unwrap();

        assert!(!rendered.html.contains("<script>"));
        assert!(rendered.html.contains("&lt;script&gt;"));
    }
}
