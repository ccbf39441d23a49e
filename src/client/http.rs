//! reqwest-backed [`FiscalClient`] implementation.
//!
//! Speaks a thin JSON envelope against a configurable base URL. The national
//! API's actual wire format (SOAP envelopes, compressed XML lots) is handled
//! by a gateway outside this crate; this client only needs identity, NSU and
//! payload fields.

use serde::Deserialize;

use crate::config::ClientConfig;
use crate::error::FetchError;
use crate::types::{CompanyId, Direction};

use super::{DocumentPage, FetchedDocument, FiscalClient, PageRequest, Session};

/// Production client for the national distribution API
pub struct HttpFiscalClient {
    http: reqwest::Client,
    base_url: url::Url,
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
struct PageResponse {
    documents: Vec<WireDocument>,
    ultimo_nsu: i64,
    has_more: bool,
    #[serde(default)]
    total_esperado: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct WireDocument {
    chave_acesso: String,
    nsu: i64,
    #[serde(default)]
    direcao: i32,
    xml: String,
    #[serde(default)]
    numero: Option<String>,
    #[serde(default)]
    valor_total: Option<f64>,
    #[serde(default)]
    emitido_em: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    contraparte: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: String,
}

impl HttpFiscalClient {
    /// Create a client from the configured base URL and request timeout
    pub fn new(config: &ClientConfig) -> Result<Self, crate::error::Error> {
        let base_url = url::Url::parse(&config.base_url).map_err(|e| crate::error::Error::Config {
            message: format!("invalid base URL '{}': {}", config.base_url, e),
            key: Some("client.base_url".to_string()),
        })?;

        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self { http, base_url })
    }

    fn endpoint(&self, path: &str) -> Result<url::Url, FetchError> {
        self.base_url
            .join(path)
            .map_err(|e| FetchError::MalformedResponse(format!("invalid endpoint path: {e}")))
    }

    /// Map a non-success HTTP response to the fetch error taxonomy
    async fn classify_error(company_id: CompanyId, response: reqwest::Response) -> FetchError {
        let status = response.status();
        let body: ApiErrorBody = response.json().await.unwrap_or(ApiErrorBody {
            message: String::new(),
        });

        match status.as_u16() {
            401 if body.message.contains("vencido") || body.message.contains("expired") => {
                FetchError::CertificateExpired { company_id }
            }
            401 | 403 => FetchError::Authentication(body.message),
            429 => FetchError::RateLimited,
            code => FetchError::Api {
                status: code,
                message: body.message,
            },
        }
    }

    fn map_transport_error(e: reqwest::Error) -> FetchError {
        if e.is_timeout() {
            FetchError::Timeout {
                elapsed_secs: 0, // reqwest does not expose the elapsed time
            }
        } else if e.is_decode() {
            FetchError::MalformedResponse(e.to_string())
        } else {
            FetchError::Api {
                status: 0,
                message: e.to_string(),
            }
        }
    }
}

#[async_trait::async_trait]
impl FiscalClient for HttpFiscalClient {
    async fn authenticate(&self, company_id: CompanyId) -> Result<Session, FetchError> {
        let endpoint = self.endpoint("auth")?;

        let response = self
            .http
            .post(endpoint)
            .json(&serde_json::json!({ "company_id": company_id.get() }))
            .send()
            .await
            .map_err(Self::map_transport_error)?;

        if !response.status().is_success() {
            return Err(Self::classify_error(company_id, response).await);
        }

        let auth: AuthResponse = response.json().await.map_err(Self::map_transport_error)?;

        Ok(Session {
            token: auth.token,
            company_id,
        })
    }

    async fn fetch_page(
        &self,
        session: &Session,
        request: &PageRequest,
    ) -> Result<DocumentPage, FetchError> {
        let endpoint = self.endpoint(&format!("distribuicao/{}", request.doc_type))?;

        let response = self
            .http
            .post(endpoint)
            .bearer_auth(&session.token)
            .json(&serde_json::json!({
                "company_id": request.company_id.get(),
                "from_nsu": request.from_nsu,
                "periodo_inicio": request.period.inicio,
                "periodo_fim": request.period.fim,
            }))
            .send()
            .await
            .map_err(Self::map_transport_error)?;

        if !response.status().is_success() {
            return Err(Self::classify_error(request.company_id, response).await);
        }

        let page: PageResponse = response.json().await.map_err(Self::map_transport_error)?;

        let documents = page
            .documents
            .into_iter()
            .map(|d| FetchedDocument {
                chave_acesso: d.chave_acesso,
                nsu: d.nsu,
                direction: Direction::from_i32(d.direcao),
                xml: d.xml,
                numero: d.numero,
                valor_total: d.valor_total,
                emitido_em: d.emitido_em,
                contraparte: d.contraparte,
            })
            .collect();

        Ok(DocumentPage {
            documents,
            ultimo_nsu: page.ultimo_nsu,
            has_more: page.has_more,
            total_esperado: page.total_esperado,
        })
    }

    async fn fetch_pdf(
        &self,
        session: &Session,
        chave_acesso: &str,
    ) -> Result<Vec<u8>, FetchError> {
        let endpoint = self.endpoint(&format!("documentos/{chave_acesso}/pdf"))?;

        let response = self
            .http
            .get(endpoint)
            .bearer_auth(&session.token)
            .send()
            .await
            .map_err(Self::map_transport_error)?;

        if response.status().as_u16() == 404 {
            return Err(FetchError::PdfUnavailable {
                chave_acesso: chave_acesso.to_string(),
            });
        }
        if !response.status().is_success() {
            return Err(Self::classify_error(session.company_id, response).await);
        }

        let bytes = response.bytes().await.map_err(Self::map_transport_error)?;
        Ok(bytes.to_vec())
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DocumentType, Period};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client_for(server: &MockServer) -> HttpFiscalClient {
        let config = ClientConfig {
            base_url: format!("{}/", server.uri()),
            request_timeout: std::time::Duration::from_secs(5),
        };
        HttpFiscalClient::new(&config).unwrap()
    }

    fn test_period() -> Period {
        Period {
            inicio: chrono::NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
            fim: chrono::NaiveDate::from_ymd_opt(2026, 1, 31).unwrap(),
        }
    }

    #[tokio::test]
    async fn authenticate_returns_session_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "token": "abc123"
            })))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let session = client.authenticate(CompanyId(1)).await.unwrap();
        assert_eq!(session.token, "abc123");
        assert_eq!(session.company_id, CompanyId(1));
    }

    #[tokio::test]
    async fn expired_certificate_maps_to_distinct_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth"))
            .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
                "message": "certificado digital vencido"
            })))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let err = client.authenticate(CompanyId(2)).await.unwrap_err();
        assert!(
            err.is_certificate_expired(),
            "expected CertificateExpired, got {err:?}"
        );
    }

    #[tokio::test]
    async fn fetch_page_decodes_documents_and_cursor() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/distribuicao/nfse"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "documents": [
                    {
                        "chave_acesso": "CHAVE-1",
                        "nsu": 1001,
                        "direcao": 1,
                        "xml": "<nfse/>",
                        "numero": "42",
                        "valor_total": 150.0
                    }
                ],
                "ultimo_nsu": 1001,
                "has_more": false,
                "total_esperado": 1
            })))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let session = Session {
            token: "t".into(),
            company_id: CompanyId(1),
        };
        let page = client
            .fetch_page(
                &session,
                &PageRequest {
                    company_id: CompanyId(1),
                    doc_type: DocumentType::Nfse,
                    from_nsu: 1000,
                    period: test_period(),
                },
            )
            .await
            .unwrap();

        assert_eq!(page.documents.len(), 1);
        assert_eq!(page.documents[0].chave_acesso, "CHAVE-1");
        assert_eq!(page.documents[0].direction, Direction::Recebida);
        assert_eq!(page.ultimo_nsu, 1001);
        assert!(!page.has_more);
        assert_eq!(page.total_esperado, Some(1));
    }

    #[tokio::test]
    async fn rate_limit_maps_to_retryable_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth"))
            .respond_with(ResponseTemplate::new(429).set_body_json(serde_json::json!({
                "message": "too many requests"
            })))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let err = client.authenticate(CompanyId(3)).await.unwrap_err();
        assert!(matches!(err, FetchError::RateLimited));
    }

    #[tokio::test]
    async fn missing_pdf_maps_to_pdf_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/documentos/CHAVE-X/pdf"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let session = Session {
            token: "t".into(),
            company_id: CompanyId(1),
        };
        let err = client.fetch_pdf(&session, "CHAVE-X").await.unwrap_err();
        assert!(matches!(err, FetchError::PdfUnavailable { .. }));
    }
}
