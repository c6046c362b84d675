pub mod notebook_servers;
