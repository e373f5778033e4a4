use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use wicket::{
    ClientHandle, Error, Exchange, Handler, Message, Room, RoomHandler, Router, Server, StaticFiles,
    StatusCode, UserData, WebSocketEntry,
};

struct Chat;

impl RoomHandler for Chat {
    fn on_new(&self, room: &Room, client: &ClientHandle) {
        room.broadcast(format!("* {} joined ({} online)", client.addr(), room.len()));
    }

    fn on_message(&self, room: &Room, client: &ClientHandle, message: Message) {
        if let Some(text) = message.as_text() {
            room.broadcast(format!("{}: {text}", client.addr()));
        }
    }

    fn on_close(&self, room: &Room, client: &ClientHandle) {
        room.broadcast(format!("* {} left", client.addr()));
    }
}

struct Stats;

impl Handler for Stats {
    async fn get(&mut self, ex: &mut Exchange) -> Result<(), Error> {
        let online = ex.user_data().room().map_or(0, |room| room.len());
        ex.response
            .json(StatusCode::Ok, &serde_json::json!({ "online": online }))?;
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let room = Room::new("chat", Chat);
    let root = PathBuf::from(std::env::args().nth(1).unwrap_or_else(|| "./public".to_owned()));

    let router = Router::new()
        .route_with("/ws", || WebSocketEntry, UserData::new().with_room(room.clone()))
        .unwrap()
        .route_with("/stats", || Stats, UserData::new().with_room(room))
        .unwrap()
        .route_with("/(.*)", || StaticFiles, UserData::new().with("root", root))
        .unwrap();

    Server::builder()
        .listener(Server::bind("127.0.0.1:8080".parse().unwrap()).unwrap())
        .router(router)
        .build()
        .launch()
        .await;
}
