mod request_flow;
