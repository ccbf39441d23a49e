mod dispatcher;
mod worker;
