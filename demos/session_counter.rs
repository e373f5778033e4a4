use wicket::{Error, Exchange, Handler, Router, Server, StatusCode};

struct Counter;

impl Handler for Counter {
    async fn get(&mut self, ex: &mut Exchange) -> Result<(), Error> {
        let session = ex.session();
        let count = session.get::<usize>("count").unwrap_or(0) + 1;
        session.set("count", count).map_err(|err| Error::Internal(err.to_string()))?;

        ex.response
            .json(StatusCode::Ok, &serde_json::json!({ "count_request": count }))?;
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    Server::builder()
        .listener(Server::bind("127.0.0.1:8080".parse().unwrap()).unwrap())
        .router(Router::new().route("/", || Counter).unwrap())
        .build()
        .launch()
        .await;
}
